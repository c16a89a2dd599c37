//! Mailbox (C1): correlated request/response over a bidirectional byte
//! channel, per spec §4.1.
//!
//! A `Mailbox` does not own a socket or pipe; it is handed an outgoing
//! line sink (`mpsc::UnboundedSender<String>`) by whatever transport wraps
//! it (TCP in [`crate::transport::tcp`], IPC in
//! [`crate::transport::ipc`]), and the transport feeds incoming lines back
//! in via [`Mailbox::on_line`]. This mirrors spec §4.3's framing: "built on
//! the same Mailbox", with the transport supplying only the byte channel.

use crate::error::SchematError;
use crate::ids::{CorrelationId, MAX_CORRELATION_ID};
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

/// A callback invoked for every inbound request/notification. Returning
/// `Ok(None)` means "no value" (distinct from `Ok(Some(Value::Null))`),
/// per spec §4.1's "Response without a result field".
pub type Callback =
    Arc<dyn Fn(JsonValue) -> BoxFuture<'static, Result<Option<JsonValue>, SchematError>> + Send + Sync>;

struct PendingEntry {
    sender: oneshot::Sender<Result<Option<JsonValue>, SchematError>>,
    sent_at: Instant,
}

/// Correlated request/response layer on top of a bidirectional byte
/// stream (C1, spec §4.1).
pub struct Mailbox {
    pending: dashmap::DashMap<u64, PendingEntry>,
    next_id: AtomicU64,
    timeout: Duration,
    out_tx: mpsc::UnboundedSender<String>,
    callback: Callback,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Mailbox {
    /// Builds a mailbox writing lines to `out_tx` and dispatching inbound
    /// requests to `callback`. Starts the timeout sweeper immediately.
    #[must_use]
    pub fn new(out_tx: mpsc::UnboundedSender<String>, timeout: Duration, callback: Callback) -> Arc<Self> {
        let mailbox = Arc::new(Self {
            pending: dashmap::DashMap::new(),
            next_id: AtomicU64::new(0),
            timeout,
            out_tx,
            callback,
            sweeper: std::sync::Mutex::new(None),
        });
        let sweeper_handle = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move {
                mailbox.run_sweeper().await;
            })
        };
        *mailbox.sweeper.lock().expect("sweeper mutex poisoned") = Some(sweeper_handle);
        mailbox
    }

    fn alloc_id(&self) -> u64 {
        let prev = self.next_id.fetch_add(1, Ordering::Relaxed);
        CorrelationId::next(prev % MAX_CORRELATION_ID).value()
    }

    /// Sends `msg` and awaits the peer's response. Resolves with the
    /// peer's callback result, or rejects after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SchematError::Timeout`] if no response arrives in time,
    /// or the decoded remote error if the peer's callback failed.
    #[instrument(skip(self, msg), fields(id))]
    pub async fn send(self: &Arc<Self>, msg: JsonValue) -> Result<Option<JsonValue>, SchematError> {
        let id = self.alloc_id();
        tracing::Span::current().record("id", id);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingEntry {
                sender: tx,
                sent_at: Instant::now(),
            },
        );
        self.write_frame(&[JsonValue::from(id), msg])?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.remove(&id);
                Err(SchematError::Timeout(format!("message {id}")))
            }
            Err(_) => {
                self.pending.remove(&id);
                Err(SchematError::Timeout(format!("message {id}")))
            }
        }
    }

    /// Sends `msg` without awaiting a response (fire-and-forget).
    pub fn notify(&self, msg: JsonValue) {
        if let Err(e) = self.write_frame(&[JsonValue::from(0), msg]) {
            warn!(error = %e, "notify failed to write frame");
        }
    }

    /// Cancels the timeout sweeper. Pending futures are left for the
    /// caller's own logic to deal with, per spec §4.1 ("close() cancels
    /// the timeout sweeper; pending futures remain rejected by caller
    /// logic, not by close itself").
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().expect("sweeper mutex poisoned").take() {
            handle.abort();
        }
    }

    fn write_frame(&self, frame: &[JsonValue]) -> Result<(), SchematError> {
        let line = serde_json::to_string(&JsonValue::Array(frame.to_vec()))?;
        self.out_tx
            .send(line)
            .map_err(|_| SchematError::Fatal("mailbox output channel closed".into()))
    }

    /// Feeds one decoded incoming line into the mailbox, per spec §4.1:
    /// `[id, msg, err?]` with `id > 0` a request, `id == 0` a
    /// notification, `id < 0` a response.
    pub async fn on_line(self: &Arc<Self>, line: &str) {
        let value: JsonValue = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "malformed mailbox frame");
                return;
            }
        };
        let Some(arr) = value.as_array() else {
            error!("mailbox frame was not an array");
            return;
        };
        let Some(id) = arr.first().and_then(JsonValue::as_i64) else {
            error!("mailbox frame missing id");
            return;
        };

        match id.cmp(&0) {
            std::cmp::Ordering::Greater => {
                let msg = arr.get(1).cloned().unwrap_or(JsonValue::Null);
                self.handle_request(id.unsigned_abs(), msg);
            }
            std::cmp::Ordering::Equal => {
                let msg = arr.get(1).cloned().unwrap_or(JsonValue::Null);
                self.handle_notification(msg);
            }
            std::cmp::Ordering::Less => {
                let correlation = id.unsigned_abs();
                let result = arr.get(2).cloned().filter(|e| !e.is_null()).map_or_else(
                    || Ok(arr.get(1).cloned()),
                    |err_value| {
                        serde_json::from_value::<crate::error::EncodedError>(err_value)
                            .map(|e| Err(e.into_ipc_error("error processing request")))
                            .unwrap_or_else(|e| Err(SchematError::Serialization(e)))
                    },
                );
                self.fulfill(correlation, result);
            }
        }
    }

    fn handle_request(self: &Arc<Self>, id: u64, msg: JsonValue) {
        let mailbox = Arc::clone(self);
        let callback = Arc::clone(&self.callback);
        tokio::spawn(async move {
            let frame = match callback(msg).await {
                Ok(Some(result)) => vec![JsonValue::from(-i64::try_from(id).unwrap_or(i64::MAX)), result],
                Ok(None) => vec![JsonValue::from(-i64::try_from(id).unwrap_or(i64::MAX))],
                Err(e) => vec![
                    JsonValue::from(-i64::try_from(id).unwrap_or(i64::MAX)),
                    JsonValue::Null,
                    serde_json::to_value(e.encode()).unwrap_or(JsonValue::Null),
                ],
            };
            if let Err(e) = mailbox.write_frame(&frame) {
                error!(error = %e, "failed to write mailbox response");
            }
        });
    }

    fn handle_notification(self: &Arc<Self>, msg: JsonValue) {
        let callback = Arc::clone(&self.callback);
        tokio::spawn(async move {
            if let Err(e) = callback(msg).await {
                warn!(error = %e, "notification callback failed");
            }
        });
    }

    fn fulfill(&self, correlation: u64, result: Result<Option<JsonValue>, SchematError>) {
        if let Some((_, entry)) = self.pending.remove(&correlation) {
            let _ = entry.sender.send(result);
        } else {
            debug!(correlation, "late or unknown response ignored");
        }
    }

    async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.timeout);
        loop {
            interval.tick().await;
            let now = Instant::now();
            let expired: Vec<u64> = self
                .pending
                .iter()
                .filter(|e| now.duration_since(e.value().sent_at) >= self.timeout)
                .map(|e| *e.key())
                .collect();
            for id in expired {
                if let Some((_, entry)) = self.pending.remove(&id) {
                    let _ = entry
                        .sender
                        .send(Err(SchematError::Timeout(format!("message {id}"))));
                }
            }
        }
    }
}

/// Builds a no-op callback useful for mailboxes that only ever `send`,
/// never receive requests (e.g. a pure client-side mailbox in tests).
pub fn never_callback() -> Callback {
    Arc::new(|_msg| -> BoxFuture<'static, Result<Option<JsonValue>, SchematError>> {
        Box::pin(async { Err(SchematError::NotFound("no handler installed".into())) })
    })
}

/// Wraps a synchronous-looking async closure as a [`Callback`].
pub fn callback_fn<F, Fut>(f: F) -> Callback
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<JsonValue>, SchematError>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)) as BoxFuture<'static, Result<Option<JsonValue>, SchematError>>)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wires two mailboxes' line channels together so `send`/`notify` on
    /// one is observed by the other, as if over a real byte stream.
    fn connected_pair(
        timeout: Duration,
        cb_a: Callback,
        cb_b: Callback,
    ) -> (Arc<Mailbox>, Arc<Mailbox>) {
        let (a_out, mut a_in) = mpsc::unbounded_channel::<String>();
        let (b_out, mut b_in) = mpsc::unbounded_channel::<String>();
        let a = Mailbox::new(a_out, timeout, cb_a);
        let b = Mailbox::new(b_out, timeout, cb_b);

        let b_clone = Arc::clone(&b);
        tokio::spawn(async move {
            while let Some(line) = a_in.recv().await {
                b_clone.on_line(&line).await;
            }
        });
        let a_clone = Arc::clone(&a);
        tokio::spawn(async move {
            while let Some(line) = b_in.recv().await {
                a_clone.on_line(&line).await;
            }
        });
        (a, b)
    }

    #[tokio::test]
    async fn send_resolves_with_peer_result() {
        let echo = callback_fn(|msg| async move { Ok(Some(msg)) });
        let (a, _b) = connected_pair(Duration::from_secs(1), never_callback(), echo);
        let result = a.send(JsonValue::from("hello")).await.unwrap();
        assert_eq!(result, Some(JsonValue::from("hello")));
    }

    #[tokio::test]
    async fn notify_never_awaits_a_response() {
        let (a, _b) = connected_pair(Duration::from_secs(1), never_callback(), never_callback());
        a.notify(JsonValue::from("fire-and-forget"));
    }

    #[tokio::test]
    async fn send_times_out_when_peer_is_slow() {
        let slow = callback_fn(|_msg| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Some(JsonValue::from("too-late")))
        });
        let (a, _b) = connected_pair(Duration::from_millis(50), never_callback(), slow);
        let result = a.send(JsonValue::Null).await;
        assert!(matches!(result, Err(SchematError::Timeout(_))));
    }

    #[tokio::test]
    async fn response_with_no_value_is_distinct_from_null() {
        let no_value = callback_fn(|_msg| async move { Ok(None) });
        let (a, _b) = connected_pair(Duration::from_secs(1), never_callback(), no_value);
        let result = a.send(JsonValue::Null).await.unwrap();
        assert_eq!(result, None);

        let returns_null = callback_fn(|_msg| async move { Ok(Some(JsonValue::Null)) });
        let (a2, _b2) = connected_pair(Duration::from_secs(1), never_callback(), returns_null);
        let result_null = a2.send(JsonValue::Null).await.unwrap();
        assert_eq!(result_null, Some(JsonValue::Null));
    }

    #[tokio::test]
    async fn error_from_peer_preserves_kind() {
        let failing = callback_fn(|_msg| async move { Err(SchematError::NotFound("agent 7".into())) });
        let (a, _b) = connected_pair(Duration::from_secs(1), never_callback(), failing);
        let err = a.send(JsonValue::Null).await.unwrap_err();
        match err {
            SchematError::Ipc { cause, .. } => assert!(matches!(*cause, SchematError::NotFound(_))),
            other => panic!("expected Ipc-wrapped NotFound, got {other:?}"),
        }
    }
}
