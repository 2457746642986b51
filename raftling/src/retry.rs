//! Transport error classification and async retry with exponential backoff.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use rand::thread_rng;
use rand::Rng;

use crate::error::NetworkError;

/// The classification of a transport-layer failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The operation was slow but a response did arrive.
    NetworkDelay,
    /// No response arrived before the deadline.
    NetworkTimeout,
    /// An established connection was dropped, reset or otherwise failed.
    ConnectionFailure,
    /// The peer stalled while framing a message.
    SerializationTimeout,
    /// The payload was malformed and could not be decoded.
    SerializationError,
    /// The peer violated the RPC protocol.
    ProtocolError,
    /// A failure which is expected to clear shortly.
    TemporaryFailure,
    /// The target host could not be reached.
    NetworkUnreachable,
    /// The connection attempt was actively refused.
    ConnectionRefused,
}

impl ErrorCategory {
    /// Check if an error of this category may be retried.
    ///
    /// Malformed payloads and protocol violations will fail identically on every attempt, and a
    /// delayed operation has already produced a response; everything else is worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorCategory::NetworkDelay | ErrorCategory::SerializationError | ErrorCategory::ProtocolError
        )
    }

    /// Check if this category indicates that the peer may be unreachable (partition signal).
    pub fn is_timeout_class(&self) -> bool {
        matches!(
            self,
            ErrorCategory::NetworkTimeout | ErrorCategory::NetworkUnreachable | ErrorCategory::SerializationTimeout
        )
    }
}

/// Classify a transport error into an `ErrorCategory`.
///
/// Errors carrying a typed `NetworkError` are classified precisely; anything else falls back to
/// message heuristics, defaulting to `NetworkTimeout` as the most conservative retryable class.
pub fn classify(err: &anyhow::Error) -> ErrorCategory {
    if let Some(net_err) = err.downcast_ref::<NetworkError>() {
        return match net_err {
            NetworkError::Timeout => ErrorCategory::NetworkTimeout,
            NetworkError::Unreachable => ErrorCategory::NetworkUnreachable,
            NetworkError::ConnectionRefused => ErrorCategory::ConnectionRefused,
            NetworkError::ConnectionReset => ErrorCategory::ConnectionFailure,
            NetworkError::SerializationTimeout => ErrorCategory::SerializationTimeout,
            NetworkError::Serialization(_) => ErrorCategory::SerializationError,
            NetworkError::Protocol(_) => ErrorCategory::ProtocolError,
            NetworkError::Temporary(_) => ErrorCategory::TemporaryFailure,
        };
    }

    let msg = err.to_string().to_lowercase();
    if msg.contains("refused") {
        ErrorCategory::ConnectionRefused
    } else if msg.contains("unreachable") || msg.contains("isolated") {
        ErrorCategory::NetworkUnreachable
    } else if msg.contains("reset") || msg.contains("closed") || msg.contains("dropped") {
        ErrorCategory::ConnectionFailure
    } else if msg.contains("malformed") || msg.contains("decode") || msg.contains("deserialize") {
        ErrorCategory::SerializationError
    } else if msg.contains("slow") || msg.contains("delay") {
        ErrorCategory::NetworkDelay
    } else {
        ErrorCategory::NetworkTimeout
    }
}

/// A retry policy for transport operations: exponential backoff with bounded jitter.
///
/// The delay sequence is `d₀ = initial_delay`, `dₖ₊₁ = min(dₖ · backoff_multiplier, max_delay)`,
/// each multiplied by a factor drawn uniformly from `[1 - jitter_factor, 1 + jitter_factor]`.
/// Delays are awaited with the async timer; the retry loop never blocks a worker thread.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Get an iterator over the jittered delays to wait between attempts.
    pub fn delays(&self) -> Delays {
        Delays {
            policy: *self,
            next_base: self.initial_delay,
        }
    }

    /// Run `f` until it succeeds, its error is non-retryable, or `max_attempts` is exhausted.
    ///
    /// The final error is returned untouched so that callers may still classify it.
    #[tracing::instrument(level = "trace", skip(self, f))]
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut f: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut delays = self.delays();
        let mut attempt = 1usize;
        loop {
            match f().await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    let category = classify(&err);
                    if !category.is_retryable() || attempt >= self.max_attempts {
                        tracing::debug!(operation, attempt, ?category, error=%err, "giving up on operation");
                        return Err(err);
                    }
                    let delay = delays.next().unwrap_or(self.max_delay);
                    tracing::debug!(operation, attempt, ?category, ?delay, "retrying operation after backoff");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// The infinite sequence of backoff delays produced by a `RetryPolicy`.
pub struct Delays {
    policy: RetryPolicy,
    next_base: Duration,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let base = self.next_base;
        let grown = base.mul_f64(self.policy.backoff_multiplier);
        self.next_base = std::cmp::min(grown, self.policy.max_delay);

        let jitter = self.policy.jitter_factor;
        if jitter == 0.0 {
            return Some(base);
        }
        let factor = thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Some(base.mul_f64(factor))
    }
}

/// A sliding window over the most recent error categories observed from a single peer.
///
/// When the window is full and every entry is timeout-class, a network partition is suspected.
/// The signal is advisory only: it feeds logs and metrics, never Raft decisions.
pub struct ErrorMonitor {
    window: VecDeque<ErrorCategory>,
    capacity: usize,
}

impl ErrorMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a classified error.
    pub fn record(&mut self, category: ErrorCategory) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(category);
    }

    /// Clear the window after a successful exchange with the peer.
    pub fn record_success(&mut self) {
        self.window.clear();
    }

    /// Check if the recent error pattern suggests a network partition.
    pub fn suspects_partition(&self) -> bool {
        self.window.len() == self.capacity && self.window.iter().all(|c| c.is_timeout_class())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use anyhow::anyhow;

    use super::*;

    fn policy_no_jitter() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 5,
        }
    }

    #[test]
    fn test_delay_sequence_doubles_and_caps() {
        let delays: Vec<_> = policy_no_jitter().delays().take(5).collect();
        assert_eq!(delays, vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(40),
            Duration::from_millis(40),
        ]);
    }

    #[test]
    fn test_jittered_delays_stay_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            ..policy_no_jitter()
        };
        for _ in 0..1000 {
            let first = policy.delays().next().unwrap();
            assert!(first >= Duration::from_millis(5), "delay {:?} below jitter floor", first);
            assert!(first <= Duration::from_millis(15), "delay {:?} above jitter ceiling", first);
        }
    }

    #[test]
    fn test_classify_typed_errors() {
        let err = anyhow::Error::new(NetworkError::Unreachable);
        assert_eq!(classify(&err), ErrorCategory::NetworkUnreachable);
        let err = anyhow::Error::new(NetworkError::Protocol("bad frame".into()));
        assert_eq!(classify(&err), ErrorCategory::ProtocolError);
        assert!(!classify(&err).is_retryable());
    }

    #[test]
    fn test_classify_untyped_errors_by_message() {
        assert_eq!(classify(&anyhow!("connection refused")), ErrorCategory::ConnectionRefused);
        assert_eq!(classify(&anyhow!("target node is isolated")), ErrorCategory::NetworkUnreachable);
        assert_eq!(classify(&anyhow!("something inexplicable")), ErrorCategory::NetworkTimeout);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..policy_no_jitter()
        };
        let res: anyhow::Result<()> = policy
            .retry("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::Error::new(NetworkError::Serialization("garbage".into()))) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts_on_retryable() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 3,
            ..policy_no_jitter()
        };
        let res: anyhow::Result<()> = policy
            .retry("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::Error::new(NetworkError::Timeout)) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..policy_no_jitter()
        };
        let res = policy
            .retry("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow::Error::new(NetworkError::Temporary("flap".into())))
                    } else {
                        Ok(42u64)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(res, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_partition_heuristic() {
        let mut monitor = ErrorMonitor::new(3);
        monitor.record(ErrorCategory::NetworkTimeout);
        monitor.record(ErrorCategory::NetworkTimeout);
        assert!(!monitor.suspects_partition(), "window not yet full");

        monitor.record(ErrorCategory::NetworkUnreachable);
        assert!(monitor.suspects_partition());

        monitor.record(ErrorCategory::ConnectionRefused);
        assert!(!monitor.suspects_partition(), "refused is not a timeout-class error");

        monitor.record_success();
        monitor.record(ErrorCategory::NetworkTimeout);
        assert!(!monitor.suspects_partition(), "window cleared on success");
    }
}
