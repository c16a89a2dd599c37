//! IPC transport (C3, spec §4.3): a [`crate::mailbox::Mailbox`] carried
//! over a child process's stdin/stdout. No retry and no duplicate
//! suppression — a dead child is a fatal condition the caller handles by
//! restarting the worker, not by resending frames (spec §4.3: "unlike TCP,
//! IPC assumes a reliable byte pipe; a broken pipe is fatal, not retried").

use super::{spawn_line_reader, spawn_line_writer};
use crate::error::SchematError;
use crate::mailbox::{Callback, Mailbox};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// A [`Mailbox`] wired to an arbitrary reader/writer pair, for stdio IPC.
pub struct IpcChannel {
    mailbox: Arc<Mailbox>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl IpcChannel {
    /// Wires `reader`/`writer` as an IPC channel. Used directly by a
    /// worker process wrapping its own stdin/stdout.
    pub fn new<R, W>(reader: R, writer: W, timeout: Duration, callback: Callback) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let writer_task = spawn_line_writer(writer, out_rx);
        let mailbox = Mailbox::new(out_tx, timeout, callback);
        let reader_task = {
            let mailbox = Arc::clone(&mailbox);
            spawn_line_reader(reader, move |line| {
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

    /// True once either direction of the pipe has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.writer_task.is_finished() || self.reader_task.is_finished()
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        self.mailbox.close();
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

/// A worker process spawned by the master, with its stdio wired as an IPC
/// channel (spec §4.3, the master side of "the worker's stdin/stdout").
pub struct WorkerProcess {
    child: Child,
    channel: Arc<IpcChannel>,
}

impl WorkerProcess {
    /// Spawns `command` with piped stdio and wires it as an IPC channel.
    ///
    /// # Errors
    ///
    /// Returns [`SchematError::Io`] if the process fails to spawn, or
    /// [`SchematError::Fatal`] if its stdio was not piped as requested.
    pub fn spawn(mut command: Command, timeout: Duration, callback: Callback) -> Result<Self, SchematError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SchematError::Fatal("worker stdin was not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchematError::Fatal("worker stdout was not piped".into()))?;
        let channel = IpcChannel::new(stdout, stdin, timeout, callback);
        Ok(Self { child, channel })
    }

    /// The IPC channel to this worker.
    #[must_use]
    pub fn channel(&self) -> Arc<IpcChannel> {
        Arc::clone(&self.channel)
    }

    /// The OS process id, for diagnostics.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the child to exit. A non-fatal crash should trigger a
    /// supervised restart at the caller (spec §4.3, §4.7 worker lifecycle),
    /// not be treated as a transport retry.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Forcibly kills the worker process.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill worker process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value as JsonValue;
    use tokio::io::duplex;

    #[tokio::test]
    async fn channel_over_in_memory_duplex_round_trips() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        let echo = crate::mailbox::callback_fn(|msg| async move { Ok(Some(msg)) });
        let _server = IpcChannel::new(server_read, server_write, Duration::from_secs(1), echo);
        let client = IpcChannel::new(
            client_read,
            client_write,
            Duration::from_secs(1),
            crate::mailbox::never_callback(),
        );

        let result = client.mailbox().send(JsonValue::from(42)).await.unwrap();
        assert_eq!(result, Some(JsonValue::from(42)));
    }
}
