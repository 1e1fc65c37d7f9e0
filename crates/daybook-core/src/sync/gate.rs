//! Pull gate
//!
//! Pulls stay blocked until the replica has loaded its local state, a
//! credential is available, and the warm-up interval has passed since the
//! coordinator was built. The gate opens once and never closes again.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullGateState {
    Blocked,
    Open,
}

/// Inputs the gate checks besides elapsed time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub hydrated: bool,
    pub has_credential: bool,
}

#[derive(Debug)]
pub struct PullGate {
    started: Instant,
    warmup: Duration,
    state: PullGateState,
}

impl PullGate {
    /// Start the warm-up clock now
    pub fn new(warmup: Duration) -> Self {
        Self {
            started: Instant::now(),
            warmup,
            state: PullGateState::Blocked,
        }
    }

    pub fn state(&self) -> PullGateState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == PullGateState::Open
    }

    /// Time left before the warm-up condition holds
    pub fn warmup_remaining(&self) -> Duration {
        self.warmup.saturating_sub(self.started.elapsed())
    }

    /// Re-check the readiness conditions
    ///
    /// Returns `true` only on the call that opens the gate.
    pub fn evaluate(&mut self, readiness: Readiness) -> bool {
        if self.is_open() {
            return false;
        }
        if readiness.hydrated && readiness.has_credential && self.warmup_remaining().is_zero() {
            self.state = PullGateState::Open;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const READY: Readiness = Readiness {
        hydrated: true,
        has_credential: true,
    };

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_warmup() {
        let mut gate = PullGate::new(Duration::from_millis(2000));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!gate.evaluate(READY));
        assert_eq!(gate.state(), PullGateState::Blocked);
        assert_eq!(gate.warmup_remaining(), Duration::from_millis(1500));

        tokio::time::advance(Duration::from_millis(1501)).await;
        assert!(gate.evaluate(READY));
        assert!(gate.is_open());

        // Opening is reported once
        assert!(!gate.evaluate(READY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requires_every_condition() {
        let mut gate = PullGate::new(Duration::ZERO);

        assert!(!gate.evaluate(Readiness {
            hydrated: false,
            has_credential: true,
        }));
        assert!(!gate.evaluate(Readiness {
            hydrated: true,
            has_credential: false,
        }));
        assert!(gate.evaluate(READY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_closes_again() {
        let mut gate = PullGate::new(Duration::ZERO);
        assert!(gate.evaluate(READY));

        gate.evaluate(Readiness {
            hydrated: false,
            has_credential: false,
        });
        assert!(gate.is_open());
    }
}
