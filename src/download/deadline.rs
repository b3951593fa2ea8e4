use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// The session's overall time budget ran out.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("session deadline of {budget:?} exceeded")]
pub struct DeadlineExceeded {
    pub budget: Duration,
}

/// One fixed budget shared by every wait in a browser session.
///
/// Started once when the session opens; each wait gets whatever is left.
#[derive(Debug, Clone, Copy)]
pub struct SessionDeadline {
    started: Instant,
    budget: Duration,
}

impl SessionDeadline {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Run `fut` for at most the remaining budget.
    pub async fn timeout<F: Future>(&self, fut: F) -> Result<F::Output, DeadlineExceeded> {
        tokio::time::timeout(self.remaining(), fut)
            .await
            .map_err(|_| DeadlineExceeded {
                budget: self.budget,
            })
    }
}
