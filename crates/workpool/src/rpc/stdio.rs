//! Newline-delimited JSON destination over a byte stream pair

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::destination::{DestinationEvent, DestinationEvents, RpcDestination};
use super::envelope::RpcEnvelope;
use crate::error::{PoolError, Result};

/// Destination speaking one JSON envelope per line
///
/// Used on both sides of a process worker: the parent wraps the child's
/// stdout/stdin, the child wraps its own stdin/stdout. Lines that do not
/// parse as an envelope are skipped so stray output cannot wedge the
/// channel.
#[derive(Clone)]
pub struct StdioDestination {
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl std::fmt::Debug for StdioDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioDestination")
            .field("open", &self.outbound.lock().is_some())
            .finish()
    }
}

impl StdioDestination {
    /// Wire a reader and writer into a destination
    ///
    /// `spawn` is raised immediately; `close` follows end of input and
    /// `error` follows a read or write failure.
    pub fn new<R, W>(reader: R, writer: W) -> (Self, DestinationEvents)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(DestinationEvent::Spawn);

        tokio::spawn(write_lines(writer, line_rx, events_tx.clone()));
        tokio::spawn(read_lines(reader, events_tx));

        let destination = Self {
            outbound: Arc::new(Mutex::new(Some(line_tx))),
        };
        (destination, events_rx)
    }

    /// Destination over this process's own stdin and stdout
    pub fn from_process_stdio() -> (Self, DestinationEvents) {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Stop writing; the writer half is flushed and dropped
    pub fn shutdown(&self) {
        self.outbound.lock().take();
    }
}

impl RpcDestination for StdioDestination {
    fn send(&self, envelope: RpcEnvelope) -> Result<()> {
        let line = serde_json::to_string(&envelope)?;
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(line).map_err(|_| PoolError::DestinationClosed),
            None => Err(PoolError::DestinationClosed),
        }
    }
}

async fn write_lines<W>(
    mut writer: W,
    mut lines: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<DestinationEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = lines.recv().await {
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            debug!(error = %err, "stdio write failed");
            let _ = events.send(DestinationEvent::Error(err.to_string()));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_lines<R>(reader: R, events: mpsc::UnboundedSender<DestinationEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RpcEnvelope>(line) {
                    Ok(envelope) => {
                        if events.send(DestinationEvent::Message(envelope)).is_err() {
                            return;
                        }
                    }
                    Err(err) => trace!(error = %err, "skipping non-envelope line"),
                }
            }
            Ok(None) => {
                let _ = events.send(DestinationEvent::Close);
                return;
            }
            Err(err) => {
                let _ = events.send(DestinationEvent::Error(err.to_string()));
                return;
            }
        }
    }
}
