//! Streaming state tracker for in-flight agent messages.
//!
//! Each stream accumulates the text chunks of one agent message under its
//! message id. A stream leaves the tracker only by completion, cancellation,
//! or the timeout sweep; entries are removed, never marked dead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::message::MessageRole;
use crate::{AppError, Result};

/// Chunk inactivity after which a stream is swept.
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Accumulator for one in-flight agent message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamingState {
    /// Message being streamed.
    pub message_id: String,
    /// Owning session.
    pub session_id: String,
    /// Always [`MessageRole::Agent`].
    pub role: MessageRole,
    /// Text received so far.
    pub content: String,
    /// First chunk time.
    pub started_at: DateTime<Utc>,
    /// Latest chunk or touch.
    pub last_chunk_at: DateTime<Utc>,
}

/// Keyed accumulator of in-flight agent messages.
#[derive(Debug)]
pub struct StreamTracker {
    streams: HashMap<String, StreamingState>,
    timeout: Duration,
}

impl Default for StreamTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_TIMEOUT)
    }
}

impl StreamTracker {
    /// Create a tracker whose sweep drops streams idle longer than `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            streams: HashMap::new(),
            timeout,
        }
    }

    /// Begin accumulating `message_id` for `session_id`.
    ///
    /// An already-tracked id is left exactly as it is.
    pub fn start_stream(&mut self, message_id: &str, session_id: &str) {
        if self.streams.contains_key(message_id) {
            debug!(message_id, session_id, "stream already active, start ignored");
            return;
        }

        let now = Utc::now();
        self.streams.insert(
            message_id.to_owned(),
            StreamingState {
                message_id: message_id.to_owned(),
                session_id: session_id.to_owned(),
                role: MessageRole::Agent,
                content: String::new(),
                started_at: now,
                last_chunk_at: now,
            },
        );
        debug!(message_id, session_id, "stream started");
    }

    /// Append `text` to the stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `message_id` is not tracked.
    pub fn add_chunk(&mut self, message_id: &str, text: &str) -> Result<()> {
        let state = self
            .streams
            .get_mut(message_id)
            .ok_or_else(|| not_tracked(message_id))?;
        state.content.push_str(text);
        state.last_chunk_at = Utc::now();
        Ok(())
    }

    /// Refresh the last-chunk time of every stream owned by `session_id`.
    pub fn touch_stream(&mut self, session_id: &str) {
        let now = Utc::now();
        for state in self
            .streams
            .values_mut()
            .filter(|state| state.session_id == session_id)
        {
            state.last_chunk_at = now;
        }
    }

    /// Remove the stream and return its full text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `message_id` is not tracked.
    pub fn complete_stream(&mut self, message_id: &str) -> Result<String> {
        let state = self
            .streams
            .remove(message_id)
            .ok_or_else(|| not_tracked(message_id))?;
        debug!(message_id, bytes = state.content.len(), "stream completed");
        Ok(state.content)
    }

    /// Remove the stream, discarding its text. Untracked ids are ignored.
    pub fn cancel_stream(&mut self, message_id: &str) {
        if self.streams.remove(message_id).is_some() {
            debug!(message_id, "stream cancelled");
        }
    }

    /// Drop streams idle longer than the timeout; returns the removed ids.
    pub fn cleanup_timed_out_streams(&mut self) -> Vec<String> {
        self.cleanup_timed_out_streams_at(Utc::now())
    }

    /// [`cleanup_timed_out_streams`](Self::cleanup_timed_out_streams) against
    /// an explicit clock.
    pub fn cleanup_timed_out_streams_at(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);
        let expired: Vec<String> = self
            .streams
            .values()
            .filter(|state| now.signed_duration_since(state.last_chunk_at) > timeout)
            .map(|state| state.message_id.clone())
            .collect();

        for message_id in &expired {
            if let Some(state) = self.streams.remove(message_id) {
                warn!(
                    message_id,
                    session_id = state.session_id,
                    "stream timed out without completion"
                );
            }
        }
        expired
    }

    /// Whether `message_id` is tracked.
    #[must_use]
    pub fn is_active(&self, message_id: &str) -> bool {
        self.streams.contains_key(message_id)
    }

    /// The live state of a stream.
    #[must_use]
    pub fn get_state(&self, message_id: &str) -> Option<&StreamingState> {
        self.streams.get(message_id)
    }

    /// Number of tracked streams.
    #[must_use]
    pub fn get_active_count(&self) -> usize {
        self.streams.len()
    }

    /// Copies of every tracked stream.
    #[must_use]
    pub fn get_active_streams(&self) -> Vec<StreamingState> {
        self.streams.values().cloned().collect()
    }
}

fn not_tracked(message_id: &str) -> AppError {
    AppError::NotFound(format!("no active stream for message {message_id}"))
}

/// Tracker shared between the coordinator and the sweep task.
pub type SharedStreamTracker = Arc<Mutex<StreamTracker>>;

/// Lock a shared tracker, recovering from poisoning.
pub fn lock_tracker(tracker: &SharedStreamTracker) -> MutexGuard<'_, StreamTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawn the periodic timeout sweep.
#[must_use]
pub fn spawn_stream_sweeper(
    tracker: SharedStreamTracker,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("stream sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = lock_tracker(&tracker).cleanup_timed_out_streams();
                    if !removed.is_empty() {
                        info!(count = removed.len(), "swept timed-out streams");
                    }
                }
            }
        }
    })
}
