//! Retry interval computation for failed worker API calls.

use crate::api_types::RetryPolicy;

pub const DEFAULT_INITIAL_INTERVAL_SECONDS: i32 = 1;
pub const DEFAULT_BACKOFF_COEFFICIENT: f64 = 2.0;
pub const DEFAULT_MAXIMUM_INTERVAL_SECONDS: i32 = 60;
// zero means unbounded for both attempt count and attempt duration
pub const DEFAULT_MAXIMUM_ATTEMPTS: i32 = 0;
pub const DEFAULT_MAXIMUM_ATTEMPTS_DURATION_SECONDS: i32 = 0;

/// Compute the next backoff interval, or `None` when retries are exhausted.
///
/// `completed_attempts` counts attempts already made, including the one that
/// just failed; the first retry sleeps the initial interval and each further
/// retry multiplies by the coefficient, capped at the maximum.
pub fn next_backoff_interval(
    completed_attempts: i32,
    first_attempt_timestamp_seconds: i64,
    policy: Option<&RetryPolicy>,
    now_unix_seconds: i64,
) -> Option<i32> {
    let default = RetryPolicy::default();
    let policy = policy.unwrap_or(&default);

    let maximum_attempts = policy.maximum_attempts.unwrap_or(DEFAULT_MAXIMUM_ATTEMPTS);
    if maximum_attempts > 0 && completed_attempts >= maximum_attempts {
        return None;
    }

    let maximum_duration = policy
        .maximum_attempts_duration_seconds
        .unwrap_or(DEFAULT_MAXIMUM_ATTEMPTS_DURATION_SECONDS);
    if maximum_duration > 0
        && first_attempt_timestamp_seconds + i64::from(maximum_duration) < now_unix_seconds
    {
        return None;
    }

    let initial_interval = policy
        .initial_interval_seconds
        .unwrap_or(DEFAULT_INITIAL_INTERVAL_SECONDS);
    let coefficient = policy
        .backoff_coefficient
        .unwrap_or(DEFAULT_BACKOFF_COEFFICIENT);
    let maximum_interval = policy
        .maximum_interval_seconds
        .unwrap_or(DEFAULT_MAXIMUM_INTERVAL_SECONDS);

    let exponent = completed_attempts.saturating_sub(1).max(0);
    let next_interval = (f64::from(initial_interval) * coefficient.powi(exponent)) as i64;
    let next_interval = next_interval.clamp(0, i64::from(maximum_interval)) as i32;
    Some(next_interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(
        initial: i32,
        coefficient: f64,
        maximum_interval: i32,
        maximum_attempts: i32,
    ) -> RetryPolicy {
        RetryPolicy {
            initial_interval_seconds: Some(initial),
            backoff_coefficient: Some(coefficient),
            maximum_interval_seconds: Some(maximum_interval),
            maximum_attempts: Some(maximum_attempts),
            maximum_attempts_duration_seconds: None,
        }
    }

    #[test]
    fn defaults_apply_when_policy_is_absent() {
        // first retry sleeps the initial interval
        assert_eq!(next_backoff_interval(1, 0, None, 0), Some(1));
        // 1 * 2^3 = 8
        assert_eq!(next_backoff_interval(4, 0, None, 0), Some(8));
        // capped at 60
        assert_eq!(next_backoff_interval(10, 0, None, 0), Some(60));
        // default attempts are unbounded
        assert_eq!(next_backoff_interval(1_000_000, 0, None, 0), Some(60));
    }

    #[test]
    fn interval_grows_monotonically_up_to_the_cap() {
        let p = policy(1, 2.0, 10, 0);
        let mut last = 0;
        for attempts in 1..10 {
            let interval = next_backoff_interval(attempts, 0, Some(&p), 0).unwrap();
            assert!(interval >= last);
            assert!(interval <= 10);
            last = interval;
        }
        assert_eq!(last, 10);
    }

    #[test]
    fn maximum_attempts_stops_retries() {
        let p = policy(1, 2.0, 10, 3);
        assert!(next_backoff_interval(2, 0, Some(&p), 0).is_some());
        assert!(next_backoff_interval(3, 0, Some(&p), 0).is_none());
        assert!(next_backoff_interval(4, 0, Some(&p), 0).is_none());
    }

    #[test]
    fn maximum_attempts_duration_stops_retries() {
        let p = RetryPolicy {
            maximum_attempts_duration_seconds: Some(100),
            ..Default::default()
        };
        // still inside the window
        assert!(next_backoff_interval(1, 1_000, Some(&p), 1_050).is_some());
        // past the window
        assert!(next_backoff_interval(1, 1_000, Some(&p), 1_101).is_none());
    }

    #[test]
    fn retry_exhaustion_schedule_matches_policy() {
        // MaxAttempts=3, Initial=1s, Coeff=2.0: sleeps are 1s then 2s, then
        // the third failure exhausts.
        let p = policy(1, 2.0, 10, 3);
        assert_eq!(next_backoff_interval(1, 0, Some(&p), 0), Some(1));
        assert_eq!(next_backoff_interval(2, 0, Some(&p), 0), Some(2));
        assert_eq!(next_backoff_interval(3, 0, Some(&p), 0), None);
    }
}
