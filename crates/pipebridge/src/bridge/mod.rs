//! Worker channel plumbing.
//!
//! # Architecture
//!
//! - **channel**: the duplex channel and its persistent reply cursor
//! - **codec**: resynchronizing JSON framer for the reply stream
//! - **transport**: opening the named pipes (unix only)

pub mod channel;
pub mod codec;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(unix)]
pub mod transport;

pub use channel::{ChannelError, DEFAULT_MAX_REPLY_BYTES, DuplexChannel, ReplyReader, terminate};
pub use codec::{ResyncCodec, Scan, scan};
#[cfg(unix)]
pub use transport::{PipePaths, TransportError, open_pipes};
