//! Transport layer for pipebridge.
//!
//! HTTP is the long-running front end; `oneshot` answers a single request
//! read from stdin, for use under an inetd-style supervisor.

pub mod http;
pub mod oneshot;

pub use http::{ServerConfig, serve};
