//! Consecutive parent send failures

use tracing::{debug, warn};

/// Counts failed sends to the parent since the last success
#[derive(Debug, Clone)]
pub struct ParentFailureTracker {
    /// Consecutive failures
    count: u32,
    /// Failures tolerated before the parent is considered lost
    threshold: u32,
}

impl ParentFailureTracker {
    /// Create a tracker that trips once `threshold` is exceeded
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    /// Record a failed send. Returns true when the parent should be
    /// searched for again; the count restarts in that case.
    pub fn record_failure(&mut self, parent: u8) -> bool {
        self.count += 1;
        debug!("Send to parent {} failed (count: {})", parent, self.count);

        if self.count > self.threshold {
            warn!(
                "Parent {} unreachable after {} consecutive failures",
                parent, self.count
            );
            self.count = 0;
            return true;
        }
        false
    }

    /// Record a successful send
    pub fn record_success(&mut self) {
        if self.count > 0 {
            debug!("Parent reachable again after {} failures", self.count);
        }
        self.count = 0;
    }

    /// Current consecutive failures
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Forget all failures
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_after_threshold_exceeded() {
        let mut tracker = ParentFailureTracker::new(5);
        for _ in 0..5 {
            assert!(!tracker.record_failure(0));
        }
        assert_eq!(tracker.count(), 5);
        assert!(tracker.record_failure(0));
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_success_resets() {
        let mut tracker = ParentFailureTracker::new(5);
        for _ in 0..5 {
            tracker.record_failure(0);
        }
        tracker.record_success();
        assert_eq!(tracker.count(), 0);
        assert!(!tracker.record_failure(0));
    }
}
