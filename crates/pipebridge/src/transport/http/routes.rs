//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{
        HeaderValue, StatusCode,
        header::{ALLOW, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use tokio_util::bytes::{Bytes, BytesMut};

use crate::exchange::ExchangeError;
use crate::service::BridgeService;

use super::server::{BodyLimit, OversizePolicy};

/// Client-visible failure of one relayed request.
///
/// Backend detail is logged, never sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("failed to read request body: {0}")]
    BadBody(#[source] axum::Error),

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error(transparent)]
    Gateway(#[from] ExchangeError),
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        match self {
            RpcError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                [(ALLOW, "POST")],
                "only POST accepted\n",
            )
                .into_response(),
            RpcError::BadBody(e) => {
                tracing::debug!(error = %e, "Failed to read request body");
                (StatusCode::BAD_REQUEST, "read error\n").into_response()
            }
            RpcError::BodyTooLarge { limit } => {
                tracing::debug!(limit, "Rejected oversized request body");
                (StatusCode::PAYLOAD_TOO_LARGE, "request body too large\n").into_response()
            }
            RpcError::Gateway(e) => {
                tracing::warn!(error = %e, "Exchange with worker failed");
                let message = if e.is_write_failure() {
                    "backend write error\n"
                } else if e.is_abandoned() {
                    "backend timeout\n"
                } else {
                    "backend error\n"
                };
                (StatusCode::BAD_GATEWAY, message).into_response()
            }
        }
    }
}

#[derive(Clone)]
struct RouteState {
    service: Arc<BridgeService>,
    body_limit: BodyLimit,
}

/// Relay one POST body to the worker and answer with its reply.
async fn relay(
    State(state): State<RouteState>,
    request: Request,
) -> Result<Response, RpcError> {
    if !request.method().as_str().eq_ignore_ascii_case("POST") {
        return Err(RpcError::MethodNotAllowed);
    }

    let body = read_body(request.into_body(), state.body_limit).await?;

    let exchange = state.service.begin(body);
    let mut guard = exchange.guard();
    let reply = state.service.exchange(exchange).await;
    guard.disarm();
    let reply = reply?;

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (CONTENT_LENGTH, HeaderValue::from(reply.len())),
        ],
        reply,
    )
        .into_response())
}

/// Read at most `limit.max_bytes` of `body`.
///
/// Under [`OversizePolicy::Truncate`] the rest of the stream is not read.
async fn read_body(body: Body, limit: BodyLimit) -> Result<Bytes, RpcError> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(RpcError::BadBody)?;
        let room = limit.max_bytes - buf.len();

        if chunk.len() <= room {
            buf.extend_from_slice(&chunk);
            continue;
        }

        match limit.policy {
            OversizePolicy::Reject => {
                return Err(RpcError::BodyTooLarge {
                    limit: limit.max_bytes,
                });
            }
            OversizePolicy::Truncate => {
                buf.extend_from_slice(&chunk[..room]);
                tracing::debug!(limit = limit.max_bytes, "Truncated request body");
                break;
            }
        }
    }

    Ok(buf.freeze())
}

/// Build the router. Every path and method reaches [`relay`].
pub fn routes(service: Arc<BridgeService>, body_limit: BodyLimit) -> Router {
    Router::new()
        .fallback(relay)
        .with_state(RouteState {
            service,
            body_limit,
        })
}
