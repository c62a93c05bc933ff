//! Agent stdin writer task.
//!
//! Serializes each outbound [`serde_json::Value`] to one compact line
//! terminated by `\n` and writes it to the agent's stdin. Frames are written
//! in the order they were queued. Frames already queued when the writer is
//! cancelled are still written before stdin is closed.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Upper bound on flushing queued frames after cancellation.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

/// Write queued frames until cancellation or until every sender is dropped.
///
/// On cancellation the queue is closed to new frames and whatever is
/// already in it is written, within [`DRAIN_WINDOW`]. The write end is shut
/// down and dropped on return, which closes the agent's stdin.
///
/// # Errors
///
/// Returns `AppError::Io` if a write fails (e.g. the agent has exited).
pub async fn run_writer<W>(
    session_id: String,
    mut stdin: W,
    mut msg_rx: mpsc::Receiver<serde_json::Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "acp writer: cancellation received, draining queue");
                msg_rx.close();
                let drained = tokio::time::timeout(
                    DRAIN_WINDOW,
                    drain(&session_id, &mut stdin, &mut msg_rx),
                )
                .await;
                if drained.is_err() {
                    warn!(session_id, "acp writer: queued frames not flushed before stop");
                }
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(session_id, "acp writer: message channel closed, stopping");
                    break;
                };

                if let Err(err) = write_frame(&mut stdin, &value).await {
                    warn!(session_id, %err, "acp writer: write to stdin failed");
                    return Err(err);
                }
            }
        }
    }

    if let Err(err) = stdin.shutdown().await {
        debug!(session_id, %err, "acp writer: stdin shutdown failed");
    }
    Ok(())
}

/// Write every frame left in a closed queue; stops at the first failure.
async fn drain<W>(
    session_id: &str,
    stdin: &mut W,
    msg_rx: &mut mpsc::Receiver<serde_json::Value>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(value) = msg_rx.recv().await {
        if let Err(err) = write_frame(stdin, &value).await {
            debug!(session_id, %err, "acp writer: drain stopped");
            return;
        }
    }
}

async fn write_frame<W>(stdin: &mut W, value: &serde_json::Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    stdin
        .write_all(&bytes)
        .await
        .map_err(|err| AppError::Io(format!("write failed: {err}")))?;
    stdin
        .flush()
        .await
        .map_err(|err| AppError::Io(format!("flush failed: {err}")))
}
