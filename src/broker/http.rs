//! Real hyper routing for the broker's HTTP+JSON surface: `/check-in`,
//! `/pull-blocks`, `/push-blocks`, `/request-blocks`, and a debug `/status`.
//! Every route but `/status` requires an `X-User-Id` header.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::broker::Broker;
use crate::error::SyncError;
use crate::wire::{CheckInRequest, PullBlocksRequest, PushBlocksRequest, RequestBlocksRequest};

pub async fn serve(broker: Arc<Broker>, addr: SocketAddr) -> Result<(), SyncError> {
    let make_svc = make_service_fn(move |_conn| {
        let broker = broker.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let broker = broker.clone();
                async move { Ok::<_, Infallible>(route(broker, req).await) }
            }))
        }
    });

    tracing::info!(%addr, "broker listening");
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|err| SyncError::transport("serve", err))
}

async fn route(broker: Arc<Broker>, req: Request<Body>) -> Response<Body> {
    if req.uri().path() == "/status" && req.method() == Method::GET {
        let user = match user_id(&req) {
            Ok(user) => user,
            Err(resp) => return resp,
        };
        return json_response(StatusCode::OK, &broker.status(&user).await);
    }

    let user = match user_id(&req) {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    match (req.method(), req.uri().path()) {
        (&Method::POST, "/check-in") => handle_check_in(broker, user, req).await,
        (&Method::POST, "/pull-blocks") => handle_pull_blocks(broker, user, req).await,
        (&Method::POST, "/push-blocks") => handle_push_blocks(broker, user, req).await,
        (&Method::POST, "/request-blocks") => handle_request_blocks(broker, user, req).await,
        _ => json_response(StatusCode::NOT_FOUND, &serde_json::json!({"error": "not found"})),
    }
}

fn user_id(req: &Request<Body>) -> Result<String, Response<Body>> {
    match req.headers().get("X-User-Id").and_then(|v| v.to_str().ok()) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(json_response(
            StatusCode::UNAUTHORIZED,
            &serde_json::json!({"error": "missing X-User-Id header"}),
        )),
    }
}

async fn read_body<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return Err(json_response(StatusCode::BAD_REQUEST, &serde_json::json!({"error": err.to_string()})))
        }
    };
    serde_json::from_slice(&bytes).map_err(|err| {
        json_response(
            StatusCode::BAD_REQUEST,
            &serde_json::json!({"error": format!("malformed message: {err}")}),
        )
    })
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(bytes))
        .expect("static response parts are always valid")
}

async fn handle_check_in(broker: Arc<Broker>, user: String, req: Request<Body>) -> Response<Body> {
    let payload: CheckInRequest = match read_body(req).await {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    let response = broker.check_in(&user, payload).await;
    json_response(StatusCode::OK, &response)
}

async fn handle_pull_blocks(broker: Arc<Broker>, user: String, req: Request<Body>) -> Response<Body> {
    let payload: PullBlocksRequest = match read_body(req).await {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    let response = broker.pull_blocks(&user, payload).await;
    json_response(StatusCode::OK, &response)
}

async fn handle_push_blocks(broker: Arc<Broker>, user: String, req: Request<Body>) -> Response<Body> {
    let payload: PushBlocksRequest = match read_body(req).await {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    broker.push_blocks(&user, payload).await;
    json_response(StatusCode::OK, &serde_json::json!({}))
}

async fn handle_request_blocks(broker: Arc<Broker>, user: String, req: Request<Body>) -> Response<Body> {
    let payload: RequestBlocksRequest = match read_body(req).await {
        Ok(payload) => payload,
        Err(resp) => return resp,
    };
    broker.request_blocks(&user, payload).await;
    json_response(StatusCode::OK, &serde_json::json!({}))
}
