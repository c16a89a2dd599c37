//! TCP transport (C2, spec §4.2): a [`crate::mailbox::Mailbox`] carried
//! over an inter-node socket, with a connect retry loop on the sender side
//! and duplicate-request suppression on the receiver side (a resent
//! request whose response already shipped is re-acknowledged from a small
//! per-connection cache rather than re-invoked).

use super::{spawn_line_reader, spawn_line_writer};
use crate::error::SchematError;
use crate::mailbox::{Callback, Mailbox};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Tracks recently-acknowledged request ids on one connection so a resent
/// request (the sender retried before seeing our ack) is answered from
/// cache instead of re-invoked, per spec §4.2.
#[derive(Default)]
struct DedupState {
    highest_processed: AtomicU64,
    cache: dashmap::DashMap<u64, String>,
}

impl DedupState {
    fn observe_response(&self, line: &str) {
        let Ok(value) = serde_json::from_str::<JsonValue>(line) else {
            return;
        };
        let Some(id) = value.as_array().and_then(|a| a.first()).and_then(JsonValue::as_i64) else {
            return;
        };
        if id < 0 {
            let request_id = id.unsigned_abs();
            self.cache.insert(request_id, line.to_string());
            self.highest_processed.fetch_max(request_id, Ordering::AcqRel);
            // Bound cache growth: only the most recent window can plausibly
            // still be in flight on the sender's retry queue.
            if self.cache.len() > 4096 {
                let floor = self.highest_processed.load(Ordering::Acquire).saturating_sub(2048);
                self.cache.retain(|id, _| *id > floor);
            }
        }
    }

    fn cached_response_for(&self, request_id: u64) -> Option<String> {
        if request_id <= self.highest_processed.load(Ordering::Acquire) {
            self.cache.get(&request_id).map(|e| e.value().clone())
        } else {
            None
        }
    }
}

async fn dispatch_line(line: String, mailbox: &Arc<Mailbox>, dedup: &Arc<DedupState>, resend: &mpsc::UnboundedSender<String>) {
    if let Ok(value) = serde_json::from_str::<JsonValue>(&line) {
        if let Some(id) = value.as_array().and_then(|a| a.first()).and_then(JsonValue::as_i64) {
            if id > 0 {
                if let Some(cached) = dedup.cached_response_for(id.unsigned_abs()) {
                    let _ = resend.send(cached);
                    return;
                }
            }
        }
    }
    mailbox.on_line(&line).await;
}

/// The listening half of a node-to-node TCP link (spec §4.2 "TCP
/// Receiver"): accepts connections, wiring each with its own mailbox and
/// dedup window.
pub struct TcpReceiver {
    listener: TcpListener,
}

impl TcpReceiver {
    /// Binds a listener at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`SchematError::Io`] if the bind fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, SchematError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The bound local address, useful when `addr` used port `0`.
    ///
    /// # Errors
    ///
    /// Returns [`SchematError::Io`] if the socket's local address cannot be
    /// read.
    pub fn local_addr(&self) -> Result<SocketAddr, SchematError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections forever, building a fresh `callback` (via
    /// `make_callback`, keyed by peer address) and [`Mailbox`] for each.
    /// Returns only if the listener itself fails.
    ///
    /// # Errors
    ///
    /// Returns [`SchematError::Io`] if `accept` fails.
    pub async fn serve<F>(self, timeout: Duration, make_callback: F) -> Result<(), SchematError>
    where
        F: Fn(SocketAddr) -> Callback + Send + Sync + 'static,
    {
        let make_callback = Arc::new(make_callback);
        loop {
            let (stream, peer) = self.listener.accept().await?;
            info!(%peer, "accepted tcp connection");
            let callback = make_callback(peer);
            tokio::spawn(handle_connection(stream, peer, timeout, callback));
        }
    }
}

#[instrument(skip(stream, callback), fields(%peer))]
async fn handle_connection(stream: TcpStream, peer: SocketAddr, timeout: Duration, callback: Callback) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (socket_tx, socket_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = spawn_line_writer(write_half, socket_rx);

    let dedup = Arc::new(DedupState::default());
    let (capture_tx, mut capture_rx) = mpsc::unbounded_channel::<String>();
    let capture_task = {
        let dedup = Arc::clone(&dedup);
        let socket_tx = socket_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = capture_rx.recv().await {
                dedup.observe_response(&line);
                if socket_tx.send(line).is_err() {
                    break;
                }
            }
        })
    };

    let mailbox = Mailbox::new(capture_tx, timeout, callback);
    let reader_task = {
        let mailbox = Arc::clone(&mailbox);
        let dedup = Arc::clone(&dedup);
        spawn_line_reader(read_half, move |line| {
            let mailbox = Arc::clone(&mailbox);
            let dedup = Arc::clone(&dedup);
            let resend = socket_tx.clone();
            async move { dispatch_line(line, &mailbox, &dedup, &resend).await }
        })
    };

    let _ = reader_task.await;
    mailbox.close();
    writer_task.abort();
    capture_task.abort();
    info!(%peer, "tcp connection closed");
}

/// The connecting half of a node-to-node TCP link (spec §4.2 "TCP
/// Sender"): establishes the socket with a bounded retry loop, then hands
/// back a live [`Mailbox`].
pub struct TcpSender {
    mailbox: Arc<Mailbox>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl TcpSender {
    /// Connects to `addr`, retrying with linear backoff up to
    /// `max_attempts` times before giving up.
    ///
    /// # Errors
    ///
    /// Returns [`SchematError::Fatal`] if every attempt fails.
    #[instrument(skip(callback))]
    pub async fn connect_with_retry(
        addr: SocketAddr,
        timeout: Duration,
        max_attempts: u32,
        backoff: Duration,
        callback: Callback,
    ) -> Result<Arc<Self>, SchematError> {
        let mut last_err = None;
        for attempt in 1..=max_attempts {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(Self::wrap(stream, timeout, callback)),
                Err(e) => {
                    warn!(attempt, %addr, error = %e, "tcp connect attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(backoff * attempt).await;
                }
            }
        }
        Err(SchematError::Fatal(format!(
            "could not connect to {addr} after {max_attempts} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn wrap(stream: TcpStream, timeout: Duration, callback: Callback) -> Arc<Self> {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer_task = spawn_line_writer(write_half, out_rx);
        let mailbox = Mailbox::new(out_tx, timeout, callback);
        let reader_task = {
            let mailbox = Arc::clone(&mailbox);
            spawn_line_reader(read_half, move |line| {
                let mailbox = Arc::clone(&mailbox);
                async move { mailbox.on_line(&line).await }
            })
        };
        Arc::new(Self {
            mailbox,
            writer_task,
            reader_task,
        })
    }

    /// The underlying mailbox, for issuing `send`/`notify` calls.
    #[must_use]
    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    /// True once either direction of the socket has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.writer_task.is_finished() || self.reader_task.is_finished()
    }
}

impl Drop for TcpSender {
    fn drop(&mut self) {
        self.mailbox.close();
        self.writer_task.abort();
        self.reader_task.abort();
    }
}
