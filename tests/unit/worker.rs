use chrono::Duration;
use wa_gateway::worker::compute_backoff;

#[test]
fn test_compute_backoff_first_retry() {
    assert_eq!(compute_backoff(1), Duration::seconds(5));
}

#[test]
fn test_compute_backoff_zero_treated_as_first() {
    assert_eq!(compute_backoff(0), Duration::seconds(5));
}

#[test]
fn test_compute_backoff_exponential() {
    assert_eq!(compute_backoff(2), Duration::seconds(10));
    assert_eq!(compute_backoff(3), Duration::seconds(20));
    assert_eq!(compute_backoff(5), Duration::seconds(80));
    assert_eq!(compute_backoff(6), Duration::seconds(160));
}

#[test]
fn test_compute_backoff_capped() {
    assert_eq!(compute_backoff(7), Duration::seconds(300));
    assert_eq!(compute_backoff(50), Duration::seconds(300));
}
