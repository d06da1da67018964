use chrono::{DateTime, Utc};
use std::time::{Duration, SystemTime};

/// Time utilities for lock records and permit scores
pub struct TimeUtils;

impl TimeUtils {
    /// Get current UTC timestamp
    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }

    /// Convert SystemTime to `DateTime<Utc>`
    pub fn from_system_time(system_time: SystemTime) -> DateTime<Utc> {
        system_time.into()
    }

    /// Get timestamp in milliseconds since Unix epoch
    pub fn timestamp_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Milliseconds of a duration, saturating at `u64::MAX`
    pub fn duration_millis(duration: Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_millis() {
        let ts1 = TimeUtils::timestamp_millis();
        std::thread::sleep(Duration::from_millis(5));
        let ts2 = TimeUtils::timestamp_millis();

        assert!(ts2 >= ts1);
        // Jan 1, 2020
        assert!(ts1 > 1_577_836_800_000i64);
    }

    #[test]
    fn test_from_system_time() {
        let now = SystemTime::now();
        let dt = TimeUtils::from_system_time(now);
        assert!((dt.timestamp_millis() - TimeUtils::timestamp_millis()).abs() < 1000);
    }

    #[test]
    fn test_duration_millis() {
        assert_eq!(TimeUtils::duration_millis(Duration::from_secs(2)), 2000);
        assert_eq!(TimeUtils::duration_millis(Duration::MAX), u64::MAX);
    }
}
