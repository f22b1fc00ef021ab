//! Eventual consistency helpers for propagation-dependent checks.
//!
//! ServiceImport addresses and DNS answers show up in member clusters some
//! time after a Service is exported. Every check therefore polls: it runs a
//! probe, evaluates a predicate on what the probe observed, and retries at a
//! fixed interval until the predicate holds or the timeout elapses.

use crate::cluster::{ClusterError, ServiceImportRecord, ServiceRecord};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

/// Default total time a single poll may take.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Default delay between two attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout and interval of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_POLL_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// What a single probe attempt saw.
///
/// `NotReady` is the normal intermediate state (object not created yet, name
/// not propagated yet). `TransportError` is an infrastructure fault. The
/// poller retries both, but they stay distinguishable in failure reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T> {
    Value(T),
    NotReady(String),
    TransportError(String),
}

impl<T> Observation<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Observation::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_transport_error(&self) -> bool {
        matches!(self, Observation::TransportError(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Observation<U> {
        match self {
            Observation::Value(value) => Observation::Value(f(value)),
            Observation::NotReady(reason) => Observation::NotReady(reason),
            Observation::TransportError(message) => Observation::TransportError(message),
        }
    }
}

impl<T> From<Result<T, ClusterError>> for Observation<T> {
    /// `NotFound` means "not there yet"; every other error is a transport fault.
    fn from(result: Result<T, ClusterError>) -> Self {
        match result {
            Ok(value) => Observation::Value(value),
            Err(e @ ClusterError::NotFound { .. }) => Observation::NotReady(e.to_string()),
            Err(e) => Observation::TransportError(e.to_string()),
        }
    }
}

impl<T: fmt::Debug> fmt::Display for Observation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observation::Value(value) => write!(f, "{value:?}"),
            Observation::NotReady(reason) => write!(f, "not ready: {reason}"),
            Observation::TransportError(message) => write!(f, "transport error: {message}"),
        }
    }
}

/// A poll that never saw a satisfying value.
#[derive(Debug, Clone)]
pub struct PollTimeout<T> {
    pub description: String,
    pub expected: String,
    pub timeout: Duration,
    pub attempts: usize,
    pub elapsed: Duration,
    pub last: Option<Observation<T>>,
}

impl<T: fmt::Debug> fmt::Display for PollTimeout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {} within {:?}, gave up after {} attempts; last observed: ",
            self.description, self.expected, self.timeout, self.attempts
        )?;
        match &self.last {
            Some(observation) => write!(f, "{observation}"),
            None => f.write_str("nothing"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for PollTimeout<T> {}

/// A condition an observed value must meet, with a description for reports.
pub trait Expectation<T> {
    fn is_met(&self, value: &T) -> bool;

    /// Human-readable form of the condition, e.g. `output containing "10.0.0.5"`.
    fn describe(&self) -> String;
}

/// Command output must contain a substring.
#[derive(Debug, Clone)]
pub struct ContainsSubstring(pub String);

impl Expectation<String> for ContainsSubstring {
    fn is_met(&self, value: &String) -> bool {
        value.contains(&self.0)
    }

    fn describe(&self) -> String {
        format!("output containing {:?}", self.0)
    }
}

/// The observed collection or text must not be empty.
#[derive(Debug, Clone, Copy)]
pub struct NonEmpty;

impl<T> Expectation<Vec<T>> for NonEmpty {
    fn is_met(&self, value: &Vec<T>) -> bool {
        !value.is_empty()
    }

    fn describe(&self) -> String {
        "a non-empty result".to_string()
    }
}

impl Expectation<String> for NonEmpty {
    fn is_met(&self, value: &String) -> bool {
        !value.trim().is_empty()
    }

    fn describe(&self) -> String {
        "non-empty output".to_string()
    }
}

impl Expectation<Option<String>> for NonEmpty {
    fn is_met(&self, value: &Option<String>) -> bool {
        value.as_deref().is_some_and(|v| !v.trim().is_empty())
    }

    fn describe(&self) -> String {
        "a non-empty value".to_string()
    }
}

/// The Service or ServiceImport must have been assigned an address.
#[derive(Debug, Clone, Copy)]
pub struct HasAddress;

impl Expectation<ServiceImportRecord> for HasAddress {
    fn is_met(&self, value: &ServiceImportRecord) -> bool {
        value.first_ip().is_some()
    }

    fn describe(&self) -> String {
        "a ServiceImport with at least one IP".to_string()
    }
}

impl Expectation<ServiceRecord> for HasAddress {
    fn is_met(&self, value: &ServiceRecord) -> bool {
        value.assigned_ip().is_some()
    }

    fn describe(&self) -> String {
        "a Service with an assigned cluster IP".to_string()
    }
}

/// Poll `probe` until `expectation` holds for the observed value.
///
/// See [`poll_until`] for timing semantics.
pub async fn eventually<T, F, Fut, E>(
    policy: &PollPolicy,
    description: &str,
    probe: F,
    expectation: &E,
) -> Result<T, PollTimeout<T>>
where
    T: fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Observation<T>>,
    E: Expectation<T> + ?Sized,
{
    poll_until(
        policy,
        description,
        &expectation.describe(),
        probe,
        |value| expectation.is_met(value),
    )
    .await
}

/// Poll `probe` until `predicate` holds for the observed value.
///
/// The probe runs immediately, then every `policy.interval` (the last sleep is
/// capped to the remaining budget). Returns the first satisfying value. Once
/// `policy.timeout` has elapsed, fails with the last observation. Non-values
/// (`NotReady`, `TransportError`) never satisfy the predicate.
///
/// A single attempt may run for the remaining budget, or one interval at the
/// deadline; an attempt that outlives it is recorded as a `TransportError`.
pub async fn poll_until<T, F, Fut, P>(
    policy: &PollPolicy,
    description: &str,
    expected: &str,
    mut probe: F,
    mut predicate: P,
) -> Result<T, PollTimeout<T>>
where
    T: fmt::Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Observation<T>>,
    P: FnMut(&T) -> bool,
{
    let start = Instant::now();
    let mut attempts = 0usize;

    loop {
        attempts += 1;
        let attempt_budget = policy
            .timeout
            .saturating_sub(start.elapsed())
            .max(policy.interval);

        let observation = match timeout(attempt_budget, probe()).await {
            Ok(Observation::Value(value)) if predicate(&value) => {
                debug!(description, attempts, "Condition met");
                return Ok(value);
            }
            Ok(observation) => observation,
            Err(_) => Observation::TransportError(format!(
                "attempt timed out after {attempt_budget:?}"
            )),
        };

        debug!(description, attempt = attempts, observed = %observation, "Condition not met yet");

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            warn!(
                description,
                attempts,
                timeout = ?policy.timeout,
                last_observed = %observation,
                "Condition not met within timeout"
            );
            return Err(PollTimeout {
                description: description.to_string(),
                expected: expected.to_string(),
                timeout: policy.timeout,
                attempts,
                elapsed,
                last: Some(observation),
            });
        }

        let remaining = policy.timeout.saturating_sub(elapsed);
        sleep(policy.interval.min(remaining)).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(20), Duration::from_secs(1))
    }

    #[test]
    fn test_default_policy() {
        let policy = PollPolicy::default();
        assert_eq!(policy.timeout, Duration::from_secs(20));
        assert_eq!(policy.interval, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_immediately() {
        let start = Instant::now();
        let result = poll_until(
            &policy(),
            "immediate",
            "true",
            || async { Observation::Value(true) },
            |v| *v,
        )
        .await;

        assert!(result.unwrap());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_on_nth_attempt_without_extra_wait() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let start = Instant::now();

        let result = poll_until(
            &policy(),
            "third attempt",
            "count >= 3",
            move || {
                let attempts = attempts_clone.clone();
                async move { Observation::Value(attempts.fetch_add(1, Ordering::SeqCst) + 1) }
            },
            |count| *count >= 3,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two sleeps of one interval each between three attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_with_last_observation() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let start = Instant::now();

        let err = poll_until(
            &policy(),
            "never",
            "output containing \"10.0.0.5\"",
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    Observation::Value(format!("attempt {n}"))
                }
            },
            |output: &String| output.contains("10.0.0.5"),
        )
        .await
        .expect_err("Should time out");

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed <= Duration::from_secs(21));
        assert_eq!(err.attempts, attempts.load(Ordering::SeqCst));
        assert_eq!(
            err.last,
            Some(Observation::Value(format!("attempt {}", err.attempts - 1)))
        );

        let message = err.to_string();
        assert!(message.contains("never"));
        assert!(message.contains("10.0.0.5"));
        assert!(message.contains("last observed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_sleep_is_capped_to_remaining_budget() {
        let policy = PollPolicy::new(Duration::from_millis(2500), Duration::from_secs(1));
        let start = Instant::now();

        let err = poll_until(
            &policy,
            "capped",
            "true",
            || async { Observation::Value(false) },
            |v| *v,
        )
        .await
        .unwrap_err();

        assert_eq!(start.elapsed(), Duration::from_millis(2500));
        // Attempts at 0s, 1s, 2s and 2.5s.
        assert_eq!(err.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempt_is_cut_off_at_timeout() {
        let start = Instant::now();

        let err = poll_until(
            &policy(),
            "hung exec",
            "true",
            || async {
                sleep(Duration::from_secs(300)).await;
                Observation::Value(true)
            },
            |v| *v,
        )
        .await
        .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed <= Duration::from_secs(21));
        assert_eq!(err.attempts, 1);

        let last = err.last.as_ref().unwrap();
        assert!(last.is_transport_error());
        assert!(last.to_string().contains("attempt timed out after 20s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_at_deadline_gets_one_interval() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let start = Instant::now();

        let err = poll_until(
            &PollPolicy::new(Duration::from_secs(3), Duration::from_secs(1)),
            "slow at deadline",
            "true",
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 3 {
                        sleep(Duration::from_secs(60)).await;
                    }
                    Observation::Value(false)
                }
            },
            |v| *v,
        )
        .await
        .unwrap_err();

        // Attempts at 0s, 1s, 2s, then the deadline attempt is cut off after 1s.
        assert_eq!(err.attempts, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert!(err.last.as_ref().unwrap().is_transport_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = eventually(
            &policy(),
            "flaky exec",
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    match attempts.fetch_add(1, Ordering::SeqCst) {
                        0 => Observation::TransportError("stream closed".to_string()),
                        1 => Observation::NotReady("pod pending".to_string()),
                        _ => Observation::Value("Address: 10.0.0.5".to_string()),
                    }
                }
            },
            &ContainsSubstring("10.0.0.5".to_string()),
        )
        .await;

        assert_eq!(result.unwrap(), "Address: 10.0.0.5");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_transport_error_visible() {
        let err = eventually(
            &PollPolicy::new(Duration::from_secs(3), Duration::from_secs(1)),
            "broken exec",
            || async { Observation::<String>::TransportError("connection refused".to_string()) },
            &ContainsSubstring("10.0.0.5".to_string()),
        )
        .await
        .unwrap_err();

        assert!(err.last.as_ref().unwrap().is_transport_error());
        assert!(err
            .to_string()
            .contains("transport error: connection refused"));
    }

    #[test]
    fn test_observation_from_cluster_result() {
        let not_found: Observation<()> = Err(ClusterError::NotFound {
            kind: "ServiceImport",
            namespace: "ns".to_string(),
            name: "hello".to_string(),
        })
        .into();
        assert!(matches!(not_found, Observation::NotReady(_)));

        let api: Observation<()> = Err(ClusterError::Api("timeout".to_string())).into();
        assert!(api.is_transport_error());

        let ok: Observation<u8> = Ok(7).into();
        assert_eq!(ok.value(), Some(&7));
    }

    #[test]
    fn test_expectations() {
        assert!(ContainsSubstring("10.0.0.5".into()).is_met(&"Address: 10.0.0.5".to_string()));
        assert!(!ContainsSubstring("10.0.0.5".into()).is_met(&String::new()));

        assert!(!Expectation::<Vec<u8>>::is_met(&NonEmpty, &vec![]));
        assert!(Expectation::<Vec<u8>>::is_met(&NonEmpty, &vec![1]));
        assert!(!Expectation::<String>::is_met(&NonEmpty, &"  \n".to_string()));
        assert!(!Expectation::<Option<String>>::is_met(&NonEmpty, &None));
        assert!(Expectation::<Option<String>>::is_met(&NonEmpty, &Some("x".to_string())));

        let import = ServiceImportRecord {
            ips: vec!["10.0.0.5".to_string()],
        };
        assert!(HasAddress.is_met(&import));
        assert!(!HasAddress.is_met(&ServiceImportRecord::default()));

        let service = ServiceRecord {
            cluster_ip: Some(String::new()),
        };
        assert!(!HasAddress.is_met(&service));
    }
}
