//! HTTP transport: one POST route relayed to the worker channel.

mod routes;
mod server;

pub use routes::{RpcError, routes};
pub use server::{
    BodyLimit, DEFAULT_MAX_BODY_BYTES, OversizePolicy, ServerConfig, run, serve,
};
