//! In-memory worker fakes for unit tests.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::channel::DuplexChannel;

/// Spawn a worker that answers every request line with `respond(line)`.
///
/// Each received line (without its terminator) is also forwarded on the
/// returned receiver so tests can check what crossed the channel.
pub(crate) fn spawn_worker<F>(
    mut respond: F,
) -> (DuplexChannel, mpsc::UnboundedReceiver<String>, JoinHandle<()>)
where
    F: FnMut(&str) -> String + Send + 'static,
{
    let (bridge_in, worker_in) = duplex(64 * 1024);
    let (mut worker_out, bridge_out) = duplex(64 * 1024);
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut lines = BufReader::new(worker_in).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = respond(&line);
            let _ = seen_tx.send(line);
            if worker_out.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    (DuplexChannel::new(bridge_in, bridge_out), seen_rx, handle)
}

/// Worker that adds `"ok":true` to every JSON object it receives.
pub(crate) fn spawn_ok_worker() -> (DuplexChannel, mpsc::UnboundedReceiver<String>, JoinHandle<()>)
{
    spawn_worker(|line| {
        let mut value: serde_json::Value = serde_json::from_str(line).unwrap();
        value["ok"] = serde_json::Value::Bool(true);
        format!("{value}\n")
    })
}
