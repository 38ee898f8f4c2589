//! The circuit breaker (spec §4.4): counts consecutive tool failures,
//! trips at a configurable threshold, and auto-resets after an optional
//! cooldown.

use std::time::{Duration, Instant};

/// Tracks consecutive tool failures across a run. Not thread-shared: the
/// loop controller owns one instance and mutates it only from its own
/// flow of control (spec §5).
pub struct CircuitBreaker {
    max_consecutive_failures: u32,
    cooldown: Option<Duration>,
    consecutive_failures: u32,
    tripped_at: Option<Instant>,
    last_error: Option<String>,
}

impl CircuitBreaker {
    pub fn new(max_consecutive_failures: u32, cooldown: Option<Duration>) -> Self {
        Self {
            max_consecutive_failures,
            cooldown,
            consecutive_failures: 0,
            tripped_at: None,
            last_error: None,
        }
    }

    /// Records one tool outcome. Returns `true` if this call caused the
    /// breaker to trip.
    pub fn record(&mut self, success: bool, error: Option<&str>) -> bool {
        self.maybe_auto_reset();
        if success {
            self.consecutive_failures = 0;
            self.last_error = None;
            return false;
        }
        self.consecutive_failures += 1;
        self.last_error = error.map(str::to_string);
        if self.consecutive_failures >= self.max_consecutive_failures && self.tripped_at.is_none() {
            self.tripped_at = Some(Instant::now());
            return true;
        }
        false
    }

    /// Whether the breaker is currently tripped. Consults the cooldown
    /// first, auto-resetting if it has elapsed.
    pub fn is_tripped(&mut self) -> bool {
        self.maybe_auto_reset();
        self.tripped_at.is_some()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Manually resets the breaker (spec §4.1's exit handling: "append a
    /// synthetic assistant message... and reset the breaker").
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.tripped_at = None;
        self.last_error = None;
    }

    fn maybe_auto_reset(&mut self) {
        if let (Some(tripped_at), Some(cooldown)) = (self.tripped_at, self.cooldown) {
            if tripped_at.elapsed() >= cooldown {
                self.reset();
            }
        }
    }

    /// A warning injected into the model's context as the breaker nears
    /// its limit.
    pub fn model_facing_warning(&self) -> Option<String> {
        if self.consecutive_failures == 0 || self.tripped_at.is_some() {
            return None;
        }
        Some(format!(
            "Warning: {} consecutive tool failures ({} until execution stops). \
             Reconsider your approach before retrying.",
            self.consecutive_failures,
            self.max_consecutive_failures.saturating_sub(self.consecutive_failures)
        ))
    }

    /// A user-facing message carrying the last error, for the synthetic
    /// assistant message appended when the breaker trips.
    pub fn user_facing_message(&self) -> String {
        match &self.last_error {
            Some(error) => format!(
                "Execution stopped after {} consecutive tool failures. Last error: {error}",
                self.consecutive_failures
            ),
            None => format!(
                "Execution stopped after {} consecutive tool failures.",
                self.consecutive_failures
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(5, None);
        breaker.record(false, Some("err"));
        breaker.record(false, Some("err"));
        assert_eq!(breaker.consecutive_failures(), 2);
        breaker.record(true, None);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn trips_at_threshold() {
        let mut breaker = CircuitBreaker::new(3, None);
        assert!(!breaker.record(false, Some("e")));
        assert!(!breaker.record(false, Some("e")));
        assert!(breaker.record(false, Some("e")));
        assert!(breaker.is_tripped());
    }

    #[test]
    fn does_not_trip_twice_for_same_run() {
        let mut breaker = CircuitBreaker::new(2, None);
        breaker.record(false, Some("e"));
        assert!(breaker.record(false, Some("e")));
        assert!(!breaker.record(false, Some("e")));
    }

    #[test]
    fn reset_clears_tripped_state() {
        let mut breaker = CircuitBreaker::new(1, None);
        breaker.record(false, Some("boom"));
        assert!(breaker.is_tripped());
        breaker.reset();
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn cooldown_auto_resets_on_read() {
        let mut breaker = CircuitBreaker::new(1, Some(Duration::from_millis(1)));
        breaker.record(false, Some("boom"));
        assert!(breaker.is_tripped());
        std::thread::sleep(Duration::from_millis(5));
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn user_facing_message_carries_last_error() {
        let mut breaker = CircuitBreaker::new(1, None);
        breaker.record(false, Some("disk full"));
        assert!(breaker.user_facing_message().contains("disk full"));
    }

    #[test]
    fn model_facing_warning_absent_when_healthy() {
        let breaker = CircuitBreaker::new(5, None);
        assert!(breaker.model_facing_warning().is_none());
    }
}
