//! Two-level cooperative cancellation for the worker.
//!
//! SIGINT maps to a soft interrupt: the stage in flight fails with reason
//! "Interrupted" but the break is preserved, so the teardown stages still
//! run. SIGTERM maps to a hard interrupt, which additionally forces the
//! break to `finished` so the worker tears down without waiting for
//! further commands.
//!
//! Signal handlers flip the token; the stage loop observes it at
//! engine-call boundaries and while parked at a break. A delivery is
//! consumed exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLevel {
    Soft,
    Hard,
}

impl InterruptLevel {
    /// Whether this interrupt also removes the break.
    pub fn removes_break(self) -> bool {
        matches!(self, InterruptLevel::Hard)
    }
}

#[derive(Default)]
struct Inner {
    // 0 = none, 1 = soft, 2 = hard; a later hard wins over a pending soft.
    level: AtomicU8,
    notify: Notify,
}

/// Shared cancellation token. Cheap to clone; all clones observe the same
/// pending interrupt.
#[derive(Clone, Default)]
pub struct InterruptToken {
    inner: Arc<Inner>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, level: InterruptLevel) {
        let value = match level {
            InterruptLevel::Soft => 1,
            InterruptLevel::Hard => 2,
        };
        self.inner.level.fetch_max(value, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Consume the pending interrupt, if any.
    pub fn take(&self) -> Option<InterruptLevel> {
        match self.inner.level.swap(0, Ordering::SeqCst) {
            0 => None,
            1 => Some(InterruptLevel::Soft),
            _ => Some(InterruptLevel::Hard),
        }
    }

    /// Wait for an interrupt and consume it.
    pub async fn raised(&self) -> InterruptLevel {
        loop {
            // Register for the wakeup before checking, so a raise landing
            // between the check and the await is not lost.
            let notified = self.inner.notify.notified();
            if let Some(level) = self.take() {
                return level;
            }
            notified.await;
        }
    }
}

/// Wire SIGINT and SIGTERM to the token. Must run inside a tokio runtime.
pub fn install_signal_handlers(token: InterruptToken) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            let level = tokio::select! {
                _ = interrupt.recv() => InterruptLevel::Soft,
                _ = terminate.recv() => InterruptLevel::Hard,
            };
            info!(?level, "received interrupt signal");
            token.raise(level);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn take_consumes_once() {
        let token = InterruptToken::new();
        assert_eq!(token.take(), None);
        token.raise(InterruptLevel::Soft);
        assert_eq!(token.take(), Some(InterruptLevel::Soft));
        assert_eq!(token.take(), None);
    }

    #[test]
    fn hard_wins_over_pending_soft() {
        let token = InterruptToken::new();
        token.raise(InterruptLevel::Soft);
        token.raise(InterruptLevel::Hard);
        assert_eq!(token.take(), Some(InterruptLevel::Hard));
    }

    #[test]
    fn soft_does_not_downgrade_pending_hard() {
        let token = InterruptToken::new();
        token.raise(InterruptLevel::Hard);
        token.raise(InterruptLevel::Soft);
        assert_eq!(token.take(), Some(InterruptLevel::Hard));
    }

    #[tokio::test]
    async fn raised_wakes_a_parked_waiter() {
        let token = InterruptToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.raised().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.raise(InterruptLevel::Hard);

        let level = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level, InterruptLevel::Hard);
    }

    #[tokio::test]
    async fn raised_returns_immediately_when_already_pending() {
        let token = InterruptToken::new();
        token.raise(InterruptLevel::Soft);
        let level = tokio::time::timeout(Duration::from_millis(100), token.raised())
            .await
            .unwrap();
        assert_eq!(level, InterruptLevel::Soft);
    }
}
