use std::time::{Duration, Instant};

use log::debug;

use crate::config::{MAX_NOTIFICATION_DELAY, MAX_OBSERVE_OPTION_VALUE};

/// Client side state of one Observe registration.
#[derive(Debug, Clone)]
pub struct ObserveSubscription {
    last_value: Option<u32>,
    last_timestamp: Option<Instant>,
    cancelled: bool,
    max_notification_delay: Duration,
}

impl Default for ObserveSubscription {
    fn default() -> Self {
        ObserveSubscription::new(MAX_NOTIFICATION_DELAY)
    }
}

impl ObserveSubscription {
    pub fn new(max_notification_delay: Duration) -> ObserveSubscription {
        ObserveSubscription {
            last_value: None,
            last_timestamp: None,
            cancelled: false,
            max_notification_delay,
        }
    }

    /// Whether a notification carrying `value` and received at `now` is newer
    /// than the last accepted one.
    ///
    /// Sequence numbers are compared in a cyclic space of
    /// `MAX_OBSERVE_OPTION_VALUE` values, so a counter that wraps is still
    /// seen as moving forward. Once the last accepted notification is older
    /// than the maximum notification delay, ordering is no longer trusted and
    /// any value is accepted.
    pub fn is_fresh(&self, value: u32, now: Instant) -> bool {
        if self.cancelled {
            return false;
        }

        let (last_value, last_timestamp) = match (self.last_value, self.last_timestamp) {
            (Some(v), Some(t)) => (v, t),
            _ => return true,
        };

        if now.saturating_duration_since(last_timestamp) > self.max_notification_delay {
            return true;
        }

        let distance = value
            .wrapping_sub(last_value)
            .rem_euclid(MAX_OBSERVE_OPTION_VALUE);
        distance != 0 && distance < MAX_OBSERVE_OPTION_VALUE / 2
    }

    /// Records `value` as accepted if it is fresh. Returns whether it was.
    pub fn accept(&mut self, value: u32, now: Instant) -> bool {
        if !self.is_fresh(value, now) {
            debug!(
                "discarding stale notification {} (last accepted {:?})",
                value, self.last_value
            );
            return false;
        }
        self.last_value = Some(value);
        self.last_timestamp = Some(now);
        true
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn last_value(&self) -> Option<u32> {
        self.last_value
    }

    pub fn last_timestamp(&self) -> Option<Instant> {
        self.last_timestamp
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_first_value_is_fresh() {
        let subscription = ObserveSubscription::default();
        assert!(subscription.is_fresh(1234, Instant::now()));
    }

    #[test]
    fn test_older_value_within_delay_is_stale() {
        let start = Instant::now();
        let mut subscription = ObserveSubscription::default();
        assert!(subscription.accept(5, start));
        assert!(!subscription.accept(3, start + Duration::from_secs(10)));
        assert!(!subscription.accept(5, start + Duration::from_secs(11)));
        assert_eq!(subscription.last_value(), Some(5));
        assert!(subscription.accept(6, start + Duration::from_secs(12)));
    }

    #[test]
    fn test_older_value_after_delay_is_fresh() {
        let start = Instant::now();
        let mut subscription = ObserveSubscription::default();
        assert!(subscription.accept(5, start));
        assert!(subscription.accept(3, start + Duration::from_secs(129)));
        assert_eq!(subscription.last_value(), Some(3));
    }

    #[test]
    fn test_wraparound_is_fresh() {
        let start = Instant::now();
        let mut subscription = ObserveSubscription::default();
        assert!(subscription.accept(8388607, start));
        assert!(subscription.accept(0, start + Duration::from_secs(1)));
        assert!(!subscription.accept(8388607, start + Duration::from_secs(2)));
    }

    #[test]
    fn test_cancelled_rejects_everything() {
        let start = Instant::now();
        let mut subscription = ObserveSubscription::default();
        assert!(subscription.accept(1, start));
        subscription.cancel();
        assert!(subscription.is_cancelled());
        assert!(!subscription.accept(2, start));
        assert!(!subscription.accept(2, start + Duration::from_secs(600)));
    }
}
