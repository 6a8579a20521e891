//! DGC configuration
//!
//! All knobs are optional. Defaults follow the classic lease protocol:
//! ten minute leases, checked at half-life on the server and renewed at
//! half-life on the client.

use std::time::Duration;

use crate::types::{DgcError, Result};

/// Default lease duration granted by servers
pub const DEFAULT_LEASE_VALUE: Duration = Duration::from_millis(600_000);

/// Default number of dirty-call retries before backing off for good
pub const DEFAULT_DIRTY_FAILURE_RETRIES: u32 = 5;

/// Default number of attempts for a clean call
pub const DEFAULT_CLEAN_FAILURE_RETRIES: u32 = 5;

/// Default delay before retrying clean calls that failed
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_millis(180_000);

/// Default maximum interval between full reclamation scans
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_millis(3_600_000);

/// Default time strong references are held awaiting an acknowledgment
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Default minimum delay between dirty-call retries
pub const DEFAULT_DIRTY_RETRY_FLOOR: Duration = Duration::from_millis(1_000);

/// Default upper bound on object-id array length in DGC messages
pub const DEFAULT_MAX_ARRAY_LEN: usize = 10_000;

/// Tunables for both the server and client halves of the collector
#[derive(Clone, Debug)]
pub struct DgcConfig {
    /// Lease duration granted by the server
    pub lease_value: Duration,
    /// Interval of the server's lease expiry sweep; `None` means half the
    /// lease value
    pub lease_check_interval: Option<Duration>,
    /// Minimum number of dirty retries before the client may give up
    pub dirty_failure_retries: u32,
    /// Attempts made for each clean call before it is dropped
    pub clean_failure_retries: u32,
    /// Delay before a failed clean call is attempted again
    pub clean_interval: Duration,
    /// Longest a client endpoint loop sleeps before rescanning
    pub client_gc_interval: Duration,
    /// Longest the server reaper waits between full scans
    pub server_gc_interval: Duration,
    /// How long strong references are held awaiting an acknowledgment
    pub ack_timeout: Duration,
    /// Minimum delay between consecutive dirty retries
    pub dirty_retry_floor: Duration,
    /// Maximum number of object ids accepted in one message
    pub max_array_len: usize,
}

impl Default for DgcConfig {
    fn default() -> Self {
        Self {
            lease_value: DEFAULT_LEASE_VALUE,
            lease_check_interval: None,
            dirty_failure_retries: DEFAULT_DIRTY_FAILURE_RETRIES,
            clean_failure_retries: DEFAULT_CLEAN_FAILURE_RETRIES,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
            client_gc_interval: DEFAULT_GC_INTERVAL,
            server_gc_interval: DEFAULT_GC_INTERVAL,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            dirty_retry_floor: DEFAULT_DIRTY_RETRY_FLOOR,
            max_array_len: DEFAULT_MAX_ARRAY_LEN,
        }
    }
}

impl DgcConfig {
    /// Load configuration from `DGC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_millis(&lookup, "DGC_LEASE_VALUE_MS")? {
            config.lease_value = v;
        }
        if let Some(v) = parse_millis(&lookup, "DGC_CHECK_INTERVAL_MS")? {
            config.lease_check_interval = Some(v);
        }
        if let Some(v) = parse_number::<u32, _>(&lookup, "DGC_DIRTY_FAILURE_RETRIES")? {
            config.dirty_failure_retries = v;
        }
        if let Some(v) = parse_number::<u32, _>(&lookup, "DGC_CLEAN_FAILURE_RETRIES")? {
            config.clean_failure_retries = v;
        }
        if let Some(v) = parse_millis(&lookup, "DGC_CLEAN_INTERVAL_MS")? {
            config.clean_interval = v;
        }
        if let Some(v) = parse_millis(&lookup, "DGC_CLIENT_GC_INTERVAL_MS")? {
            config.client_gc_interval = v;
        }
        if let Some(v) = parse_millis(&lookup, "DGC_SERVER_GC_INTERVAL_MS")? {
            config.server_gc_interval = v;
        }
        if let Some(v) = parse_millis(&lookup, "DGC_ACK_TIMEOUT_MS")? {
            config.ack_timeout = v;
        }
        if let Some(v) = parse_millis(&lookup, "DGC_DIRTY_RETRY_FLOOR_MS")? {
            config.dirty_retry_floor = v;
        }
        if let Some(v) = parse_number::<usize, _>(&lookup, "DGC_MAX_ARRAY_LEN")? {
            config.max_array_len = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the collector cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.lease_value.is_zero() {
            return Err(DgcError::Config("lease value must be positive".to_string()));
        }
        if self.check_interval().is_zero() {
            return Err(DgcError::Config("lease check interval must be positive".to_string()));
        }
        if self.clean_interval.is_zero() {
            return Err(DgcError::Config("clean interval must be positive".to_string()));
        }
        if self.client_gc_interval.is_zero() || self.server_gc_interval.is_zero() {
            return Err(DgcError::Config("gc intervals must be positive".to_string()));
        }
        if self.max_array_len == 0 {
            return Err(DgcError::Config("max array length must be positive".to_string()));
        }
        Ok(())
    }

    /// Effective server sweep interval
    pub fn check_interval(&self) -> Duration {
        self.lease_check_interval.unwrap_or(self.lease_value / 2)
    }

    /// Set the lease duration
    pub fn with_lease_value(mut self, lease: Duration) -> Self {
        self.lease_value = lease;
        self
    }

    /// Set the server sweep interval explicitly
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.lease_check_interval = Some(interval);
        self
    }

    /// Set the dirty retry count
    pub fn with_dirty_failure_retries(mut self, retries: u32) -> Self {
        self.dirty_failure_retries = retries;
        self
    }

    /// Set the clean retry count
    pub fn with_clean_failure_retries(mut self, retries: u32) -> Self {
        self.clean_failure_retries = retries;
        self
    }

    /// Set the clean retry delay
    pub fn with_clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval = interval;
        self
    }

    /// Set the client scan interval
    pub fn with_client_gc_interval(mut self, interval: Duration) -> Self {
        self.client_gc_interval = interval;
        self
    }

    /// Set the server scan interval
    pub fn with_server_gc_interval(mut self, interval: Duration) -> Self {
        self.server_gc_interval = interval;
        self
    }

    /// Set the acknowledgment hold timeout
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the minimum dirty retry delay
    pub fn with_dirty_retry_floor(mut self, floor: Duration) -> Self {
        self.dirty_retry_floor = floor;
        self
    }

    /// Set the object-id array limit
    pub fn with_max_array_len(mut self, len: usize) -> Self {
        self.max_array_len = len;
        self
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_number::<u64, _>(lookup, key)?.map(Duration::from_millis))
}

fn parse_number<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| DgcError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
