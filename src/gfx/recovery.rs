use log::{info, warn};

/// Device-recreation attempts allowed before the session degrades to the
/// fallback renderer for good.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Normal rendering.
    Healthy,
    /// Device lost; recreation attempts are in progress.
    Recovering,
    /// Attempt cap exhausted; only the solid-color fallback runs from here on.
    Fallback,
}

/// Device-loss state machine: Healthy → Recovering → {Healthy, Fallback}.
///
/// The attempt counter is monotonic and resets only at process start. Once it
/// would exceed [`MAX_RECOVERY_ATTEMPTS`], the phase latches to `Fallback` and
/// no further device recreation is permitted.
pub struct RecoveryState {
    phase: RecoveryPhase,
    attempts: u32,
}

impl RecoveryState {
    pub fn new() -> Self {
        Self {
            phase: RecoveryPhase::Healthy,
            attempts: 0,
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// A device-removed/hung signal or an unrecoverable frame-loop failure.
    pub fn on_device_lost(&mut self) {
        if self.phase == RecoveryPhase::Healthy {
            warn!("device lost, entering recovery");
            self.phase = RecoveryPhase::Recovering;
        }
    }

    /// Asks permission for one device-recreation attempt. Returns `false` once
    /// the cap is exhausted, latching the fallback phase.
    pub fn begin_attempt(&mut self) -> bool {
        if self.phase != RecoveryPhase::Recovering {
            return false;
        }
        self.attempts += 1;
        if self.attempts > MAX_RECOVERY_ATTEMPTS {
            warn!(
                "exceeded {MAX_RECOVERY_ATTEMPTS} recovery attempts, switching to fallback rendering"
            );
            self.phase = RecoveryPhase::Fallback;
            return false;
        }
        info!("device recovery attempt {} of {MAX_RECOVERY_ATTEMPTS}", self.attempts);
        true
    }

    pub fn on_attempt_succeeded(&mut self) {
        info!("device recovered");
        self.phase = RecoveryPhase::Healthy;
    }

    pub fn on_attempt_failed(&mut self) {
        warn!("device recovery attempt {} failed", self.attempts);
        // Stay in Recovering; the caller retries next tick until the cap
        // forces fallback.
    }
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_until_loss_is_reported() {
        let mut state = RecoveryState::new();
        assert_eq!(state.phase(), RecoveryPhase::Healthy);
        assert!(!state.begin_attempt());
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn successful_attempt_returns_to_healthy() {
        let mut state = RecoveryState::new();
        state.on_device_lost();
        assert_eq!(state.phase(), RecoveryPhase::Recovering);
        assert!(state.begin_attempt());
        state.on_attempt_succeeded();
        assert_eq!(state.phase(), RecoveryPhase::Healthy);
        assert_eq!(state.attempts(), 1);
    }

    #[test]
    fn counter_is_monotonic_and_capped() {
        let mut state = RecoveryState::new();
        state.on_device_lost();
        let mut last = 0;
        for _ in 0..MAX_RECOVERY_ATTEMPTS {
            assert!(state.begin_attempt());
            assert!(state.attempts() > last);
            last = state.attempts();
            state.on_attempt_failed();
            assert_eq!(state.phase(), RecoveryPhase::Recovering);
        }
        // The attempt after the cap is denied and latches fallback.
        assert!(!state.begin_attempt());
        assert_eq!(state.phase(), RecoveryPhase::Fallback);
    }

    #[test]
    fn no_attempts_after_fallback() {
        let mut state = RecoveryState::new();
        state.on_device_lost();
        while state.phase() == RecoveryPhase::Recovering {
            if state.begin_attempt() {
                state.on_attempt_failed();
            }
        }
        let attempts = state.attempts();
        for _ in 0..10 {
            assert!(!state.begin_attempt());
        }
        assert_eq!(state.attempts(), attempts);
        assert_eq!(state.phase(), RecoveryPhase::Fallback);
    }

    #[test]
    fn counter_survives_recovery_cycles() {
        // Four consecutive losses each burning one attempt: the fourth exceeds
        // the cap even though earlier recoveries succeeded.
        let mut state = RecoveryState::new();
        for _ in 0..MAX_RECOVERY_ATTEMPTS {
            state.on_device_lost();
            assert!(state.begin_attempt());
            state.on_attempt_succeeded();
        }
        state.on_device_lost();
        assert!(!state.begin_attempt());
        assert_eq!(state.phase(), RecoveryPhase::Fallback);
    }
}
