//! Job deadline and cancellation
//!
//! A render job has a single overall deadline. Every blocking step checks it
//! before starting and bounds its own wait by [`Deadline::remaining`], so the
//! whole job never outlives the configured timeout by more than one step's
//! polling granularity.

use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Suspension points of a render job, used to label timeouts and cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Serve,
    Launch,
    Viewport,
    Navigation,
    Load,
    Fonts,
    Capture,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Serve => "origin server start",
            Phase::Launch => "engine launch",
            Phase::Viewport => "viewport setup",
            Phase::Navigation => "navigation",
            Phase::Load => "page load",
            Phase::Fonts => "font loading",
            Phase::Capture => "capture",
        };
        f.write_str(s)
    }
}

/// Cloneable cancellation flag shared between a caller and a running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Overall time budget of one job, optionally tied to a [`CancelToken`].
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    timeout: Duration,
    cancel: Option<CancelToken>,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Fail if the job was cancelled or the deadline passed; otherwise return
    /// the time left for `phase`.
    pub fn check(&self, phase: Phase) -> Result<Duration> {
        if self.is_cancelled() {
            return Err(Error::Cancelled(phase));
        }
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(self.expired(phase));
        }
        Ok(remaining)
    }

    /// The timeout error for `phase`
    pub fn expired(&self, phase: Phase) -> Error {
        Error::Timeout {
            phase,
            timeout_ms: self.timeout_ms(),
        }
    }
}
