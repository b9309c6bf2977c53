//! Process-wide cooperative-stop flag. The core never installs signal
//! handlers itself (spec.md §9) — the host binds OS signals to this token
//! externally, or raises it on a fatal I/O error. Thin wrapper over
//! `tokio_util::sync::CancellationToken`, the same cancellation primitive
//! the teacher threads through its protocol handlers' `download()` calls.

use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct StopToken {
    token: CancellationToken,
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Raise the flag. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sleep for `duration`, returning early if the token is raised mid-sleep.
    pub async fn sleep_unless_stopped(&self, duration: std::time::Duration) {
        if self.is_stopped() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.token.cancelled() => {}
        }
    }
}
