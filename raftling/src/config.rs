//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

/// Default election timeout minimum, in milliseconds.
const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default threshold for when to trigger a snapshot.
const DEFAULT_LOGS_SINCE_LAST: u64 = 5000;
/// Default maximum number of entries per replication payload.
const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default replication lag threshold.
const DEFAULT_REPLICATION_LAG_THRESHOLD: u64 = 1000;
/// Default snapshot chunk size.
const DEFAULT_SNAPSHOT_CHUNKSIZE: u64 = 1024 * 1024 * 3;
/// Default timeout for sending a single snapshot segment, in milliseconds.
const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 200;
/// Default number of consecutive timeout-class errors before a partition is suspected.
const DEFAULT_PARTITION_ERROR_THRESHOLD: usize = 5;

/// The policy governing when to trigger a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

/// The runtime configuration for a Raft node.
///
/// The default values used by this type should generally work well for Raft clusters which will
/// be running with nodes in multiple datacenter availability zones with low latency between
/// zones. These values should typically be made configurable from the perspective of the
/// application which is being built on top of Raft.
///
/// When building the Raft configuration for your application, remember this inequality from the
/// Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`.
#[derive(Clone, Debug)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The heartbeat interval in milliseconds at which leaders will send heartbeats to followers.
    ///
    /// Defaults to 50 milliseconds.
    ///
    /// **NOTE WELL:** it is very important that this value be greater than the amount of time
    /// it will take on average for heartbeat frames to be sent between nodes. No data processing
    /// is performed for heartbeats, so the main item of concern here is network latency. This
    /// value is also used as the default timeout for sending heartbeats.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per payload allowed to be transmitted during replication.
    ///
    /// When configuring this value, it is important to note that setting this value too low could
    /// cause sub-optimal performance. This will primarily impact the speed at which slow nodes,
    /// nodes which have been offline, or nodes which are new to the cluster, are brought
    /// up-to-speed. If this is too low, it will take longer for the nodes to be brought up to
    /// consistency with the rest of the cluster.
    pub max_payload_entries: u64,
    /// The distance behind in log replication a follower must fall before it is considered "lagging".
    ///
    /// This configuration parameter controls replication streams from the leader to followers.
    pub replication_lag_threshold: u64,
    /// The snapshot policy to use for a Raft node.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum snapshot chunk size allowed when transmitting snapshots (in bytes).
    pub snapshot_max_chunk_size: u64,
    /// The timeout for sending a single snapshot segment, in milliseconds.
    pub install_snapshot_timeout: u64,
    /// The retry policy applied to replication RPCs which fail with a retryable transport error.
    pub retry_policy: RetryPolicy,
    /// The number of consecutive timeout-class transport errors observed from a single peer
    /// before a network partition is suspected.
    ///
    /// The suspicion is advisory only, surfaced through logs and metrics; it has no effect on
    /// Raft safety or liveness decisions.
    pub partition_error_threshold: usize,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    ///
    /// The cluster name must be the same for all nodes of the same cluster. Its main purpose is
    /// to show up in logs and metrics.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            snapshot_policy: None,
            snapshot_max_chunk_size: None,
            install_snapshot_timeout: None,
            retry_policy: None,
            partition_error_threshold: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
///
/// For election timeout config & heartbeat interval configuration, it is recommended that §5.6 of
/// the Raft spec be considered in order to set the appropriate values.
#[derive(Debug)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: Option<u64>,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: Option<u64>,
    /// The interval at which leaders will send heartbeats to followers to avoid election timeout.
    pub heartbeat_interval: Option<u64>,
    /// The maximum number of entries per payload allowed to be transmitted during replication.
    pub max_payload_entries: Option<u64>,
    /// The distance behind in log replication a follower must fall before it is considered "lagging".
    pub replication_lag_threshold: Option<u64>,
    /// The snapshot policy.
    pub snapshot_policy: Option<SnapshotPolicy>,
    /// The maximum snapshot chunk size.
    pub snapshot_max_chunk_size: Option<u64>,
    /// The timeout for sending a single snapshot segment.
    pub install_snapshot_timeout: Option<u64>,
    /// The retry policy for replication RPCs.
    pub retry_policy: Option<RetryPolicy>,
    /// The consecutive-error threshold for suspecting a partition.
    pub partition_error_threshold: Option<usize>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `replication_lag_threshold`.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the desired value for `snapshot_policy`.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the desired value for `snapshot_max_chunk_size`.
    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the desired value for `retry_policy`.
    pub fn retry_policy(mut self, val: RetryPolicy) -> Self {
        self.retry_policy = Some(val);
        self
    }

    /// Set the desired value for `partition_error_threshold`.
    pub fn partition_error_threshold(mut self, val: usize) -> Self {
        self.partition_error_threshold = Some(val);
        self
    }

    /// Validate the state of this builder, returning a new `Config` on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        // Roll a random election timeout, ensuring a valid range.
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let replication_lag_threshold = self.replication_lag_threshold.unwrap_or(DEFAULT_REPLICATION_LAG_THRESHOLD);
        let snapshot_policy = self.snapshot_policy.unwrap_or_else(default_snapshot_policy);
        let snapshot_max_chunk_size = self.snapshot_max_chunk_size.unwrap_or(DEFAULT_SNAPSHOT_CHUNKSIZE);
        let install_snapshot_timeout = self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT);
        let retry_policy = self.retry_policy.unwrap_or_default();
        if !(0.0..=1.0).contains(&retry_policy.jitter_factor) {
            return Err(ConfigError::InvalidJitterFactor);
        }
        if retry_policy.max_attempts == 0 {
            return Err(ConfigError::NoRetryAttempts);
        }
        let partition_error_threshold = self.partition_error_threshold.unwrap_or(DEFAULT_PARTITION_ERROR_THRESHOLD);
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries,
            replication_lag_threshold,
            snapshot_policy,
            snapshot_max_chunk_size,
            install_snapshot_timeout,
            retry_policy,
            partition_error_threshold,
        })
    }
}

fn default_snapshot_policy() -> SnapshotPolicy {
    SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.snapshot_policy, SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_SINCE_LAST));
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_error() {
        let res = Config::build("cluster0".into())
            .election_timeout_min(1000)
            .election_timeout_max(700)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeoutMinMax);
    }

    #[test]
    fn test_invalid_retry_policy_produces_error() {
        let policy = RetryPolicy {
            jitter_factor: 1.5,
            ..RetryPolicy::default()
        };
        let res = Config::build("cluster0".into()).retry_policy(policy).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidJitterFactor);

        let policy = RetryPolicy {
            max_attempts: 0,
            initial_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        };
        let res = Config::build("cluster0".into()).retry_policy(policy).validate();
        assert_eq!(res.unwrap_err(), ConfigError::NoRetryAttempts);
    }

    #[test]
    fn test_rand_election_timeout_is_within_bounds() {
        let cfg = Config::build("cluster0".into())
            .election_timeout_min(100)
            .election_timeout_max(200)
            .validate()
            .unwrap();
        for _ in 0..1000 {
            let t = cfg.new_rand_election_timeout();
            assert!((100..200).contains(&t), "election timeout {} out of range", t);
        }
    }
}
