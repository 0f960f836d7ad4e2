use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

use crate::data::ChainId;

/// The core error taxonomy from spec §7. Every variant is attributable to a
/// single URL attempt except `NoEndpoints`, which is surfaced directly.
#[derive(Debug, Error, Clone)]
pub enum ProxyError {
    #[error("no usable RPC endpoints for chain {0}")]
    NoEndpoints(ChainId),

    #[error("all endpoints failed for chain {chain_id}: {last_error}")]
    AllEndpointsFailed { chain_id: ChainId, last_error: Box<ProxyError> },

    #[error("deadline of {0}ms elapsed")]
    Timeout(u64),

    #[error("upstream returned HTTP {0}")]
    Http(u16),

    #[error("upstream JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("cache error: {0}")]
    Cache(String),
}

/// JSON-RPC wire error codes named in spec §6/§7.
pub const RPC_CODE_PARSE_ERROR: i64 = -32700;
pub const RPC_CODE_INVALID_REQUEST: i64 = -32600;
pub const RPC_CODE_INTERNAL_ERROR: i64 = -32000;

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        // spec §7: NoEndpoints and AllEndpointsFailed are the only variants
        // that ever cross into the HTTP layer; everything else is
        // swallowed by the Dispatcher before reaching here. Still, keep
        // this total so a future caller can't silently forget a variant.
        let message = self.to_string();
        let body = json!({
            "jsonrpc": "2.0",
            "id": Option::<serde_json::Value>::None,
            "error": { "code": RPC_CODE_INTERNAL_ERROR, "message": message }
        });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}
