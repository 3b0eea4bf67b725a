use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Opaque identifier a node picks for itself at startup and presents on
/// every broker call. The broker never issues or validates these beyond
/// using them as map keys.
pub type NodeId = String;

/// A single field-level or document-level mutation, tagged with the
/// information needed to order it deterministically against every other
/// update ever produced for the same collection: `(timestamp, origin_node,
/// index_in_block)`. Two updates from the same node can only tie on
/// `index_in_block` if they also tie on timestamp, which `index_in_block`
/// then breaks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Update {
    Field {
        timestamp: i64,
        collection: String,
        doc_id: String,
        field: String,
        value: serde_json::Value,
        origin_node: NodeId,
        index_in_block: usize,
    },
    Delete {
        timestamp: i64,
        collection: String,
        doc_id: String,
        origin_node: NodeId,
        index_in_block: usize,
    },
}

impl Update {
    pub fn timestamp(&self) -> i64 {
        match self {
            Update::Field { timestamp, .. } | Update::Delete { timestamp, .. } => *timestamp,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Update::Field { collection, .. } | Update::Delete { collection, .. } => collection,
        }
    }

    pub fn doc_id(&self) -> &str {
        match self {
            Update::Field { doc_id, .. } | Update::Delete { doc_id, .. } => doc_id,
        }
    }

    pub fn origin_node(&self) -> &str {
        match self {
            Update::Field { origin_node, .. } | Update::Delete { origin_node, .. } => origin_node,
        }
    }

    pub fn index_in_block(&self) -> usize {
        match self {
            Update::Field { index_in_block, .. } | Update::Delete { index_in_block, .. } => {
                *index_in_block
            }
        }
    }

    /// The `(timestamp, origin_node, index_in_block)` tuple that totally
    /// orders updates for deterministic document rebuild.
    pub fn sort_key(&self) -> (i64, NodeId, usize) {
        (self.timestamp(), self.origin_node().to_string(), self.index_in_block())
    }
}

/// The id and parent set of a block, without its payload — the shape a node
/// advertises to the broker on check-in and the shape the broker relays
/// back describing every other node's heads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeadBlockDetails {
    pub id: Uuid,
    pub prev_blocks: Vec<Uuid>,
}

/// An immutable node in a node's append-only DAG. Once committed or
/// integrated, a block's `id`, `prev_blocks` and `data` never change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: Uuid,
    pub prev_blocks: HashSet<Uuid>,
    pub data: Vec<Update>,
}

impl Block {
    pub fn head_details(&self) -> HeadBlockDetails {
        let mut prev: Vec<Uuid> = self.prev_blocks.iter().copied().collect();
        prev.sort();
        HeadBlockDetails { id: self.id, prev_blocks: prev }
    }

    /// Cutoff timestamp used by the integration walk: a block is only worth
    /// descending past if this is still at or after the replay floor.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.data.last().map(Update::timestamp)
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.data.first().map(Update::timestamp)
    }
}
