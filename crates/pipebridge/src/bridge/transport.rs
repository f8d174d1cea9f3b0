//! Named pipe transport to the worker.
//!
//! Both FIFOs are opened read-write. A FIFO opened read-only or write-only
//! blocks in `open()` until the peer opens the other end; read-write never
//! does, and keeping a writer on the reply pipe means the bridge never sees
//! EOF just because the worker restarted.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tokio::net::unix::pipe;

use super::channel::DuplexChannel;

pub const DEFAULT_IN_PIPE: &str = "/tmp/mcp-pipes/in";
pub const DEFAULT_OUT_PIPE: &str = "/tmp/mcp-pipes/out";

/// Filesystem locations of the worker's pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    /// Requests are written here.
    pub inbound: PathBuf,
    /// Replies are read from here.
    pub outbound: PathBuf,
}

impl Default for PipePaths {
    fn default() -> Self {
        Self {
            inbound: PathBuf::from(DEFAULT_IN_PIPE),
            outbound: PathBuf::from(DEFAULT_OUT_PIPE),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open pipe {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is not a named pipe", path.display())]
    NotAFifo { path: PathBuf },
}

/// Open both pipes once and wrap them in a [`DuplexChannel`].
///
/// Must be called from within a tokio runtime; the handles are registered
/// with its reactor.
pub fn open_pipes(
    paths: &PipePaths,
    max_reply_bytes: usize,
) -> Result<DuplexChannel, TransportError> {
    let inbound = open_fifo(&paths.inbound)?;
    let outbound = open_fifo(&paths.outbound)?;

    let sender = pipe::Sender::from_file(inbound).map_err(|source| TransportError::Open {
        path: paths.inbound.clone(),
        source,
    })?;
    let receiver = pipe::Receiver::from_file(outbound).map_err(|source| TransportError::Open {
        path: paths.outbound.clone(),
        source,
    })?;

    tracing::debug!(
        inbound = %paths.inbound.display(),
        outbound = %paths.outbound.display(),
        "Opened worker pipes"
    );

    Ok(DuplexChannel::new(sender, receiver).with_max_reply_bytes(max_reply_bytes))
}

fn open_fifo(path: &Path) -> Result<File, TransportError> {
    let open_err = |source| TransportError::Open {
        path: path.to_path_buf(),
        source,
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(open_err)?;

    if !file.metadata().map_err(open_err)?.file_type().is_fifo() {
        return Err(TransportError::NotAFifo {
            path: path.to_path_buf(),
        });
    }

    Ok(file)
}
