//! BridgeService: serializes exchanges over the shared worker channel.
//!
//! Requests and replies travel on two independent pipes with no correlation
//! id, so a reply can only be matched to its request if no other request is
//! ever in flight. The service enforces that with one lock over the whole
//! channel, held from the first byte written until the reply has been read.
//!
//! The write and the read run in a spawned task that owns the lock guard. A
//! caller that gives up (client disconnect, deadline) gets its error right
//! away, but the task keeps going and releases the channel only once the
//! outstanding reply has been consumed. Otherwise the next exchange would
//! receive the previous exchange's reply.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio_util::bytes::Bytes;

use crate::bridge::DuplexChannel;
use crate::exchange::{Exchange, ExchangeError};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Upper bound on waiting for the channel plus the exchange itself.
    pub exchange_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(30),
        }
    }
}

/// Transport-agnostic exchange serializer.
///
/// Owns the worker channel for the life of the process. Tokio's mutex hands
/// the channel out in FIFO order, so replies come back in the order callers
/// queued.
pub struct BridgeService {
    channel: Arc<Mutex<DuplexChannel>>,
    config: ServiceConfig,
    next_id: AtomicU64,
}

impl BridgeService {
    pub fn new(channel: DuplexChannel, config: ServiceConfig) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Start an exchange for `request`. Nothing is sent until [`Self::exchange`].
    pub fn begin(&self, request: Bytes) -> Exchange {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Exchange::new(id, request)
    }

    /// True while some exchange holds the channel.
    pub fn is_busy(&self) -> bool {
        self.channel.try_lock().is_err()
    }

    /// Send the request and wait for its reply.
    ///
    /// Returns early with `Cancelled` or `Timeout` if the exchange's token
    /// fires or the deadline passes first. If that happens while still queued
    /// for the channel, nothing is written.
    pub async fn exchange(&self, exchange: Exchange) -> Result<Bytes, ExchangeError> {
        let (id, request, cancel) = exchange.into_parts();
        let timeout = self.config.exchange_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let channel = tokio::select! {
            channel = Arc::clone(&self.channel).lock_owned() => channel,
            _ = cancel.cancelled() => {
                tracing::debug!(exchange_id = id, "Cancelled while queued for the channel");
                return Err(ExchangeError::Cancelled);
            }
            _ = &mut deadline => {
                cancel.cancel();
                tracing::warn!(exchange_id = id, ?timeout, "Timed out queued for the channel");
                return Err(ExchangeError::Timeout(timeout));
            }
        };

        let (tx, rx) = oneshot::channel();
        let abandoned = cancel.clone();
        let request_bytes = request.len();
        tokio::spawn(async move {
            let mut channel = channel;
            let outcome = channel.round_trip(request).await;

            if abandoned.is_cancelled() {
                match &outcome {
                    Ok(reply) => tracing::warn!(
                        exchange_id = id,
                        reply_bytes = reply.len(),
                        "Discarding reply for abandoned exchange"
                    ),
                    Err(e) => tracing::warn!(
                        exchange_id = id,
                        error = %e,
                        "Abandoned exchange failed"
                    ),
                }
            }

            // The reply is fully consumed; hand the channel to the next exchange.
            drop(channel);
            let _ = tx.send(outcome);
        });

        let result = tokio::select! {
            biased;
            outcome = rx => match outcome {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(e)) => Err(ExchangeError::Channel(e)),
                Err(_) => Err(ExchangeError::TaskLost),
            },
            _ = cancel.cancelled() => Err(ExchangeError::Cancelled),
            _ = &mut deadline => {
                cancel.cancel();
                Err(ExchangeError::Timeout(timeout))
            }
        };

        match &result {
            Ok(reply) => tracing::debug!(
                exchange_id = id,
                request_bytes,
                reply_bytes = reply.len(),
                "Exchange complete"
            ),
            Err(e) if e.is_abandoned() => tracing::info!(
                exchange_id = id,
                error = %e,
                "Exchange abandoned, channel stays held until its reply is read"
            ),
            Err(_) => {}
        }

        result
    }

    /// Wait up to `grace` for any in-flight exchange, then shut down the
    /// request side of the channel.
    pub async fn close(&self, grace: Duration) {
        match tokio::time::timeout(grace, self.channel.lock()).await {
            Ok(mut channel) => {
                if let Err(e) = channel.close().await {
                    tracing::warn!(error = %e, "Error closing worker channel");
                }
                tracing::debug!(
                    buffered = channel.reader().buffered(),
                    skipped = channel.reader().skipped(),
                    "Worker channel closed"
                );
            }
            Err(_) => {
                tracing::warn!(?grace, "Exchange still in flight at shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ChannelError;
    use crate::bridge::testing::{spawn_ok_worker, spawn_worker};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    fn service_with(channel: DuplexChannel) -> Arc<BridgeService> {
        Arc::new(BridgeService::new(channel, ServiceConfig::default()))
    }

    #[tokio::test]
    async fn begin_assigns_increasing_ids() {
        let (channel, _seen, _worker) = spawn_ok_worker();
        let service = service_with(channel);

        let a = service.begin(Bytes::new());
        let b = service.begin(Bytes::new());

        assert!(b.id() > a.id());
    }

    #[tokio::test]
    async fn exchange_returns_worker_reply() {
        let (channel, mut seen, _worker) = spawn_ok_worker();
        let service = service_with(channel);

        let reply = service
            .exchange(service.begin(Bytes::from_static(b"{\"id\":1}")))
            .await
            .unwrap();

        assert_eq!(&reply[..], b"{\"id\":1,\"ok\":true}");
        assert_eq!(seen.recv().await.unwrap(), "{\"id\":1}");
        assert!(!service.is_busy());
    }

    #[tokio::test]
    async fn concurrent_exchanges_stay_paired() {
        let (channel, _seen, _worker) = spawn_worker(|line| {
            let request: serde_json::Value = serde_json::from_str(line).unwrap();
            // Stray output between replies must not shift the pairing.
            format!("worker: handled\n{{\"seq\":{}}}\n", request["seq"])
        });
        let service = service_with(channel);

        let mut tasks = Vec::new();
        for seq in 0..32 {
            let service = Arc::clone(&service);
            tasks.push(tokio::spawn(async move {
                let payload = Bytes::from(format!("{{\"seq\":{seq}}}"));
                let reply = service.exchange(service.begin(payload)).await.unwrap();
                (seq, reply)
            }));
        }

        for task in tasks {
            let (seq, reply) = task.await.unwrap();
            let reply: serde_json::Value = serde_json::from_slice(&reply).unwrap();
            assert_eq!(reply["seq"], seq);
        }
    }

    #[tokio::test]
    async fn cancelled_exchange_holds_channel_until_its_reply_arrives() {
        let (bridge_in, worker_in) = duplex(1024);
        let (mut worker_out, bridge_out) = duplex(1024);
        let service = service_with(DuplexChannel::new(bridge_in, bridge_out));
        let mut requests = BufReader::new(worker_in).lines();

        let first = service.begin(Bytes::from_static(b"{\"seq\":1}"));
        let cancel = first.cancel_token();
        let pending = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.exchange(first).await })
        };

        assert_eq!(requests.next_line().await.unwrap().unwrap(), "{\"seq\":1}");
        cancel.cancel();
        assert!(matches!(
            pending.await.unwrap(),
            Err(ExchangeError::Cancelled)
        ));
        assert!(service.is_busy());

        let second = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let exchange = service.begin(Bytes::from_static(b"{\"seq\":2}"));
                service.exchange(exchange).await
            })
        };

        // The second request must wait until the first reply is consumed.
        let early = tokio::time::timeout(Duration::from_millis(50), requests.next_line()).await;
        assert!(early.is_err());

        worker_out.write_all(b"{\"seq\":1}\n").await.unwrap();
        assert_eq!(requests.next_line().await.unwrap().unwrap(), "{\"seq\":2}");
        worker_out.write_all(b"{\"seq\":2}\n").await.unwrap();

        let reply = second.await.unwrap().unwrap();
        assert_eq!(&reply[..], b"{\"seq\":2}");
    }

    #[tokio::test]
    async fn dropped_caller_cancels_through_guard() {
        let (bridge_in, worker_in) = duplex(1024);
        let (mut worker_out, bridge_out) = duplex(1024);
        let service = service_with(DuplexChannel::new(bridge_in, bridge_out));
        let mut requests = BufReader::new(worker_in).lines();

        let first = service.begin(Bytes::from_static(b"{\"seq\":1}"));
        let token = first.cancel_token();
        let guard = first.guard();
        let handler = {
            let service = Arc::clone(&service);
            async move {
                let _guard = guard;
                service.exchange(first).await
            }
        };

        // Simulates the client disconnecting: the handler future is dropped.
        assert!(
            tokio::time::timeout(Duration::from_millis(20), handler)
                .await
                .is_err()
        );
        assert!(token.is_cancelled());
        assert_eq!(requests.next_line().await.unwrap().unwrap(), "{\"seq\":1}");

        worker_out
            .write_all(b"{\"seq\":1}\n{\"seq\":2}\n")
            .await
            .unwrap();
        let reply = service
            .exchange(service.begin(Bytes::from_static(b"{\"seq\":2}")))
            .await
            .unwrap();

        assert_eq!(&reply[..], b"{\"seq\":2}");
    }

    #[tokio::test]
    async fn cancelled_while_queued_never_writes() {
        let (bridge_in, worker_in) = duplex(1024);
        let (mut worker_out, bridge_out) = duplex(1024);
        let service = service_with(DuplexChannel::new(bridge_in, bridge_out));
        let mut requests = BufReader::new(worker_in).lines();

        let holder = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let exchange = service.begin(Bytes::from_static(b"{\"seq\":1}"));
                service.exchange(exchange).await
            })
        };
        assert_eq!(requests.next_line().await.unwrap().unwrap(), "{\"seq\":1}");

        let queued = service.begin(Bytes::from_static(b"{\"seq\":2}"));
        queued.cancel_token().cancel();
        assert!(matches!(
            service.exchange(queued).await,
            Err(ExchangeError::Cancelled)
        ));

        worker_out.write_all(b"{\"seq\":1}\n").await.unwrap();
        assert_eq!(&holder.await.unwrap().unwrap()[..], b"{\"seq\":1}");

        let third = {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let exchange = service.begin(Bytes::from_static(b"{\"seq\":3}"));
                service.exchange(exchange).await
            })
        };
        assert_eq!(requests.next_line().await.unwrap().unwrap(), "{\"seq\":3}");
        worker_out.write_all(b"{\"seq\":3}\n").await.unwrap();
        assert_eq!(&third.await.unwrap().unwrap()[..], b"{\"seq\":3}");
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let (bridge_in, _worker_in) = duplex(1024);
        let (_worker_out, bridge_out) = duplex(1024);
        let service = BridgeService::new(
            DuplexChannel::new(bridge_in, bridge_out),
            ServiceConfig {
                exchange_timeout: Duration::from_millis(50),
            },
        );

        let exchange = service.begin(Bytes::from_static(b"{}"));
        let token = exchange.cancel_token();
        let err = service.exchange(exchange).await.unwrap_err();

        assert!(matches!(err, ExchangeError::Timeout(_)));
        assert!(token.is_cancelled());
        assert!(service.is_busy());
    }

    #[tokio::test]
    async fn write_failure_releases_channel() {
        let (bridge_in, worker_in) = duplex(1024);
        let (_worker_out, bridge_out) = duplex(1024);
        drop(worker_in);
        let service = service_with(DuplexChannel::new(bridge_in, bridge_out));

        for _ in 0..2 {
            let err = service
                .exchange(service.begin(Bytes::from_static(b"{}")))
                .await
                .unwrap_err();
            assert!(err.is_write_failure());
        }
        assert!(!service.is_busy());
    }

    #[tokio::test]
    async fn worker_eof_fails_exchange_without_hanging() {
        let (bridge_in, _worker_in) = duplex(1024);
        let (worker_out, bridge_out) = duplex(1024);
        drop(worker_out);
        let service = service_with(DuplexChannel::new(bridge_in, bridge_out));

        for _ in 0..2 {
            let err = service
                .exchange(service.begin(Bytes::from_static(b"{}")))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                ExchangeError::Channel(ChannelError::UnexpectedEof)
            ));
        }
    }

    #[tokio::test]
    async fn close_waits_for_idle_channel() {
        let (channel, _seen, worker) = spawn_ok_worker();
        let service = service_with(channel);

        service
            .exchange(service.begin(Bytes::from_static(b"{\"id\":1}")))
            .await
            .unwrap();
        service.close(Duration::from_secs(1)).await;

        // Shutting down the request side ends the worker's read loop.
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
