use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Cancellation handle passed into every registry call.
///
/// Clones share the same token, so a clone handed to another thread can stop
/// an operation in flight, including a request that is already waiting on
/// the network. Steps already completed are not undone.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token:    CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that counts as cancelled once `timeout` has elapsed.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token:    CancellationToken::new(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// Wraps a token owned by the caller, e.g. a child of an application
    /// wide shutdown token.
    #[must_use]
    pub const fn with_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Time left before the deadline, if one was set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Completes once the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.remaining() {
            Some(remaining) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep(remaining) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}
