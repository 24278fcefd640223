//! Cursor broadcast throttle.
//!
//! Single-slot: at most one pending cursor and one outstanding timer per
//! throttle. A submission more than one interval after the last emission goes
//! out immediately. Anything submitted inside the interval overwrites the
//! pending slot, and the timer emits whatever is in the slot when the interval
//! ends. A burst therefore costs one emission per interval, carrying the most
//! recent position.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::Cursor;

/// Callback that actually broadcasts a cursor.
pub type EmitCursor = Arc<dyn Fn(Cursor) + Send + Sync>;

#[derive(Default)]
struct ThrottleState {
    pending: Option<Cursor>,
    last_emit: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

/// Rate limiter for the local user's cursor broadcasts.
pub struct CursorThrottle {
    interval: Duration,
    state: Arc<Mutex<ThrottleState>>,
    emit: EmitCursor,
}

impl CursorThrottle {
    /// Create a throttle that calls `emit` at most once per `interval`.
    pub fn new(interval: Duration, emit: EmitCursor) -> Self {
        Self {
            interval,
            state: Arc::new(Mutex::new(ThrottleState::default())),
            emit,
        }
    }

    /// Configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Submit a new cursor position.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, cursor: Cursor) {
        let mut state = self.state.lock().unwrap();

        if state.timer.is_some() {
            state.pending = Some(cursor);
            return;
        }

        let now = Instant::now();
        let since_last = state.last_emit.map(|t| now.duration_since(t));
        match since_last {
            Some(elapsed) if elapsed < self.interval => {
                state.pending = Some(cursor);
                let wait = self.interval - elapsed;
                let shared = Arc::clone(&self.state);
                let emit = Arc::clone(&self.emit);
                state.timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(wait).await;
                    let next = {
                        let mut state = shared.lock().unwrap();
                        state.timer = None;
                        let next = state.pending.take();
                        if next.is_some() {
                            state.last_emit = Some(Instant::now());
                        }
                        next
                    };
                    if let Some(cursor) = next {
                        emit(cursor);
                    }
                }));
            }
            _ => {
                state.last_emit = Some(now);
                drop(state);
                (self.emit)(cursor);
            }
        }
    }

    /// Whether a trailing emission is scheduled.
    pub fn has_pending(&self) -> bool {
        self.state.lock().unwrap().timer.is_some()
    }

    /// Drop the pending cursor and cancel the timer.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for CursorThrottle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for CursorThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorThrottle")
            .field("interval", &self.interval)
            .field("pending", &self.has_pending())
            .finish()
    }
}
