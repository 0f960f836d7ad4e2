//! HTTP front-end (named as an out-of-core collaborator in spec §1/§6, but
//! built here so the core is exercisable end-to-end): `POST /:chain_id`
//! JSON-RPC single/batch dispatch, CORS preflight, and a `/status`
//! introspection endpoint.

use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{RPC_CODE_INTERNAL_ERROR, RPC_CODE_INVALID_REQUEST, RPC_CODE_PARSE_ERROR};
use crate::state::AppState;

const MAX_BATCH_SIZE: usize = 100;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/:chain_id", post(handle_rpc).options(handle_preflight))
        .route("/status", get(handle_status))
        .with_state(state)
}

async fn handle_preflight() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert("Access-Control-Allow-Methods", HeaderValue::from_static("POST, OPTIONS"));
    headers.insert("Access-Control-Allow-Headers", HeaderValue::from_static("Content-Type, Authorization"));
    (StatusCode::NO_CONTENT, headers)
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let whitelist = state.whitelist().await;
    let dispatcher = state.dispatcher().await;

    let mut chains = Vec::with_capacity(whitelist.chain_ids().len());
    for chain_id in whitelist.chain_ids() {
        let chain_id = *chain_id;
        let entry = dispatcher.cache_snapshot(chain_id).await;
        let (ranked, fresh) = match &entry {
            Some((cache_entry, fresh)) => (crate::data::rank_probe_map(&cache_entry.probe_map), *fresh),
            None => (Vec::new(), false),
        };
        chains.push(json!({
            "chainId": chain_id,
            "urlCount": whitelist.urls_for(chain_id).len(),
            "cached": entry.is_some(),
            "cacheFresh": fresh,
            "rankedUrls": ranked,
        }));
    }
    with_cors(Json(json!({ "chains": chains })))
}

async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Path(chain_id): Path<u64>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let cors_origin = HeaderValue::from_static("*");

    // A body that isn't valid JSON at all is a §6 parse error (-32700), not
    // an invalid-request (-32600) — the envelope itself couldn't be read.
    let Json(body) = match body {
        Ok(json) => json,
        Err(rejection) => return with_cors(parse_error(rejection.body_text())),
    };

    let dispatcher = state.dispatcher().await;

    let response = match body {
        Value::Array(items) => {
            if items.is_empty() {
                invalid_request(Value::Null, "empty batch")
            } else if items.len() > MAX_BATCH_SIZE {
                invalid_request(Value::Null, "batch too large")
            } else {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    let cancel = state.request_cancellation();
                    results.push(dispatch_one(&dispatcher, chain_id, item, &cancel).await);
                }
                Json(Value::Array(results)).into_response()
            }
        }
        single => {
            let cancel = state.request_cancellation();
            dispatch_one(&dispatcher, chain_id, single, &cancel).await
        }
    };

    let mut response = response;
    response.headers_mut().insert("Access-Control-Allow-Origin", cors_origin);
    response
}

/// `cancel` is a child of the process-wide shutdown token (spec §4.5's
/// `Send` signature needs a token of some kind, not a per-client TCP
/// disconnect signal — axum/hyper already abort this handler's future for
/// free when the client disconnects, since dropping it drops every future
/// it's awaiting). Cancelling fires when the process begins graceful
/// shutdown, not per socket.
async fn dispatch_one(
    dispatcher: &crate::dispatcher::Dispatcher,
    chain_id: u64,
    item: Value,
    cancel: &tokio_util::sync::CancellationToken,
) -> Response {
    let id = item.get("id").cloned().unwrap_or(Value::Null);

    let Some(method) = item.get("method").and_then(Value::as_str) else {
        return invalid_request(id, "missing method");
    };
    if item.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return invalid_request(id, "jsonrpc must be \"2.0\"");
    }
    let params = item.get("params").cloned().unwrap_or(Value::Array(vec![]));
    if !params.is_array() {
        return invalid_request(id, "params must be an array");
    }

    match dispatcher.send(chain_id, method, params, cancel).await {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": RPC_CODE_INTERNAL_ERROR, "message": format!("chain {chain_id}: {e}") }
            })),
        )
            .into_response(),
    }
}

fn invalid_request(id: Value, message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": RPC_CODE_INVALID_REQUEST, "message": message }
        })),
    )
        .into_response()
}

fn parse_error(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "jsonrpc": "2.0",
            "id": Value::Null,
            "error": { "code": RPC_CODE_PARSE_ERROR, "message": message }
        })),
    )
        .into_response()
}

fn with_cors<T: IntoResponse>(resp: T) -> Response {
    let mut resp = resp.into_response();
    resp.headers_mut().insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    resp
}
