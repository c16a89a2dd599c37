//! Byte-channel transports that carry [`crate::mailbox::Mailbox`] frames
//! across process and machine boundaries: [`ipc`] (C3, parent/child stdio)
//! and [`tcp`] (C2, inter-node sockets).

pub mod ipc;
pub mod tcp;

use futures::{Future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Drains `rx` and writes each line as one newline-delimited frame to
/// `writer`, per spec §4.3's line-oriented wire format.
pub(crate) fn spawn_line_writer<W>(writer: W, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = FramedWrite::new(writer, LinesCodec::new());
        while let Some(line) = rx.recv().await {
            if framed.send(line).await.is_err() {
                break;
            }
        }
    })
}

/// Reads newline-delimited frames from `reader`, invoking `handler` for
/// each. Returns once the stream closes or errors.
pub(crate) fn spawn_line_reader<R, F, Fut>(reader: R, mut handler: F) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(String) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut framed = FramedRead::new(reader, LinesCodec::new());
        while let Some(line) = framed.next().await {
            match line {
                Ok(line) => handler(line).await,
                Err(e) => {
                    tracing::error!(error = %e, "transport read error");
                    break;
                }
            }
        }
    })
}
