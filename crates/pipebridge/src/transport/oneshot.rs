//! Single-request stdio transport.
//!
//! Reads one newline-terminated request from the input, relays it through the
//! worker channel and writes a complete HTTP/1.1 response to the output. The
//! process is expected to exit afterwards; the connection is the caller's.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::bytes::Bytes;

use crate::exchange::ExchangeError;
use crate::service::BridgeService;

#[derive(Debug, thiserror::Error)]
pub enum OneshotError {
    #[error("failed to read request: {0}")]
    Input(#[source] io::Error),

    #[error("input closed before a newline-terminated request")]
    IncompleteRequest,

    #[error("failed to write response: {0}")]
    Output(#[source] io::Error),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Relay one request from `input` and write the HTTP response to `output`.
///
/// On backend failure a 502 response is still written before the error is
/// returned. Nothing is written when the request itself is incomplete.
pub async fn run_once<R, W>(
    input: R,
    mut output: W,
    service: &BridgeService,
) -> Result<usize, OneshotError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut request = Vec::new();
    BufReader::new(input)
        .read_until(b'\n', &mut request)
        .await
        .map_err(OneshotError::Input)?;

    if request.last() != Some(&b'\n') {
        return Err(OneshotError::IncompleteRequest);
    }

    let exchange = service.begin(Bytes::from(request));
    match service.exchange(exchange).await {
        Ok(reply) => {
            write_response(&mut output, "200 OK", "application/json", &reply).await?;
            Ok(reply.len())
        }
        Err(e) => {
            write_response(&mut output, "502 Bad Gateway", "text/plain", b"backend error\n")
                .await?;
            Err(e.into())
        }
    }
}

async fn write_response<W>(
    output: &mut W,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> Result<(), OneshotError>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    output
        .write_all(head.as_bytes())
        .await
        .map_err(OneshotError::Output)?;
    output.write_all(body).await.map_err(OneshotError::Output)?;
    output.flush().await.map_err(OneshotError::Output)
}
