//! Cooperative Cancellation
//!
//! Cancellation of a run is cooperative: the dispatch loop checks its token
//! at exactly one point, after a handler has settled and before the artifact
//! is resumed. A handler already in progress is never interrupted, and the
//! artifact never runs long enough between suspend points to need it.
//!
//! # Components
//!
//! - [`CancellationSource`]: owns the ability to cancel
//! - [`CancellationToken`]: a cheap, cloneable read-only view
//!
//! # Example
//!
//! ```rust
//! use tern_host::cancellation::CancellationSource;
//!
//! let source = CancellationSource::new();
//! let token = source.token();
//! assert!(token.check().is_ok());
//!
//! source.cancel_with_reason("shutting down");
//! assert_eq!(token.reason().as_deref(), Some("shutting down"));
//! assert!(token.check().is_err());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

/// What the first `cancel` call recorded. Later calls leave it alone.
#[derive(Debug, Clone)]
struct Stop {
    reason: Option<String>,
    at: Instant,
}

#[derive(Debug, Default)]
struct Shared {
    flag: AtomicBool,
    stop: Mutex<Option<Stop>>,
    upstream: Option<CancellationToken>,
}

/// Read-only view of a run's cancellation state.
///
/// Clones share one state. A token derived with [`child`](Self::child)
/// observes its own cancellation and every ancestor's.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    fn linked(upstream: Option<CancellationToken>) -> Self {
        Self {
            shared: Arc::new(Shared {
                upstream,
                ..Shared::default()
            }),
        }
    }

    /// Whether this token or any ancestor has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.flag.load(Ordering::Acquire)
            || self.shared.upstream.as_ref().is_some_and(|up| up.is_cancelled())
    }

    fn nearest_stop(&self) -> Option<Stop> {
        if self.shared.flag.load(Ordering::Acquire) {
            return self.shared.stop.lock().clone();
        }
        self.shared.upstream.as_ref().and_then(|up| up.nearest_stop())
    }

    /// The reason given to the nearest cancelled ancestor, if any.
    pub fn reason(&self) -> Option<String> {
        self.nearest_stop().and_then(|stop| stop.reason)
    }

    /// When the nearest cancelled ancestor was cancelled.
    pub fn cancelled_at(&self) -> Option<Instant> {
        self.nearest_stop().map(|stop| stop.at)
    }

    pub fn child(&self) -> CancellationToken {
        CancellationToken::linked(Some(self.clone()))
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        match self.is_cancelled() {
            true => Err(Cancelled {
                reason: self.reason(),
            }),
            false => Ok(()),
        }
    }

    fn stop(&self, reason: Option<String>) {
        let mut stop = self.shared.stop.lock();
        if stop.is_none() {
            *stop = Some(Stop {
                reason,
                at: Instant::now(),
            });
            self.shared.flag.store(true, Ordering::Release);
        }
    }

    #[cfg(test)]
    fn shares_state_with(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

static NEVER: OnceLock<CancellationToken> = OnceLock::new();

impl Default for CancellationToken {
    /// A token that is never cancelled.
    fn default() -> Self {
        NEVER.get_or_init(|| CancellationToken::linked(None)).clone()
    }
}

/// The cancelling side of a token.
#[derive(Debug)]
pub struct CancellationSource {
    token: CancellationToken,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::linked(None),
        }
    }

    /// A source whose tokens are also cancelled when `parent` is.
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            token: parent.child(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.stop(None);
    }

    pub fn cancel_with_reason(&self, reason: impl Into<String>) {
        self.token.stop(Some(reason.into()));
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by [`CancellationToken::check`] once cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run cancelled{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
pub struct Cancelled {
    pub reason: Option<String>,
}
