//! Request pipeline primitives
//!
//! Jobs, the single-slot receive waiter, and the bounded
//! exponential-backoff retry policy used by the connection's job loop.
//! Callers never see these types directly; they are the plumbing between
//! the public [`crate::Connection`] handle and its background task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::config::{LinkConfig, MAX_BACKOFF_MS};
use crate::error::{LinkError, Result};
use crate::frame::Datagram;
use crate::registry::{RegisterDesc, RegisterValue};

/// One queued unit of work for a connection's job loop
pub(crate) enum Job {
    Query {
        register: RegisterDesc,
        respond: oneshot::Sender<Result<RegisterValue>>,
    },
    Write {
        register: RegisterDesc,
        value: RegisterValue,
        respond: oneshot::Sender<Result<()>>,
    },
    /// Close request; queued behind in-flight work so close defers until
    /// the active jobs drain
    Close { done: oneshot::Sender<()> },
}

impl Job {
    /// Fail this job without running it.
    pub(crate) fn fail(self, err: LinkError) {
        match self {
            Job::Query { respond, .. } => {
                let _ = respond.send(Err(err));
            },
            Job::Write { respond, .. } => {
                let _ = respond.send(Err(err));
            },
            Job::Close { done } => {
                let _ = done.send(());
            },
        }
    }
}

/// Single-shot resolution slot bound to the current in-flight request.
///
/// The reader loop resolves it with the next response frame (or a decode
/// error); the job loop installs it before each send. The slot must be
/// empty before a new receive begins.
#[derive(Clone)]
pub(crate) struct WaiterSlot {
    slot: Arc<Mutex<Option<oneshot::Sender<Result<Datagram>>>>>,
}

impl WaiterSlot {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Install a fresh waiter, returning its receiving end.
    pub(crate) async fn install(&self) -> Result<oneshot::Receiver<Result<Datagram>>> {
        let mut guard = self.slot.lock().await;
        if guard.is_some() {
            // Single-flight violation: a second receive began before the
            // previous waiter resolved.
            return Err(LinkError::internal("receive waiter slot occupied"));
        }
        let (tx, rx) = oneshot::channel();
        *guard = Some(tx);
        Ok(rx)
    }

    /// Resolve the installed waiter. Returns false when no waiter was
    /// installed (the outcome is dropped).
    pub(crate) async fn complete(&self, outcome: Result<Datagram>) -> bool {
        let Some(tx) = self.slot.lock().await.take() else {
            return false;
        };
        if tx.send(outcome).is_err() {
            debug!("waiter abandoned before resolution");
        }
        true
    }

    /// Clear the slot after a receive timeout.
    pub(crate) async fn clear(&self) {
        *self.slot.lock().await = None;
    }
}

/// Bounded exponential-backoff retry policy
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    /// Total attempts per job (first try included)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Multiplier applied after each failed attempt
    pub multiplier: f64,
}

impl RetryPolicy {
    pub(crate) fn from_config(config: &LinkConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_delay: config.initial_backoff(),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Begin a backoff progression for one job.
    pub(crate) fn backoff(&self) -> Backoff {
        Backoff {
            delay: self.initial_delay,
            multiplier: self.multiplier,
            remaining: self.max_attempts.saturating_sub(1),
        }
    }
}

/// Delay progression for one job's retries
#[derive(Debug)]
pub(crate) struct Backoff {
    delay: Duration,
    multiplier: f64,
    remaining: u32,
}

impl Backoff {
    /// Next delay to sleep before retrying, or `None` once the attempt
    /// budget is exhausted.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let current = self.delay;
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        self.delay = Duration::from_millis(next_ms.min(MAX_BACKOFF_MS));
        Some(current)
    }
}
