//! pipebridge: HTTP front end for a JSON worker behind a pair of named pipes.

pub mod bridge;
pub mod exchange;
pub mod service;
pub mod transport;

pub use bridge::{ChannelError, DuplexChannel, ResyncCodec};
#[cfg(unix)]
pub use bridge::{PipePaths, TransportError, open_pipes};
pub use exchange::{CancellationToken, Exchange, ExchangeError, ExchangeGuard};
pub use service::{BridgeService, ServiceConfig};
pub use transport::http::{BodyLimit, OversizePolicy, RpcError};
pub use transport::oneshot::{OneshotError, run_once};
pub use transport::{ServerConfig, serve};
