//! Transport configuration.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Smallest accepted per-channel ring size.
pub const MIN_BUFFER_SIZE: u32 = 4096;

/// What to do when an inbound frame fails its checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumPolicy {
    /// Send an ERROR frame and close the connection.
    Close,
    /// Send an ERROR frame naming the message id and keep the connection.
    RequestRetransmit,
}

/// What to do with a frame whose message type is not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownTypePolicy {
    /// Hand it to the caller as `Incoming::Unrecognized`.
    Deliver,
    /// Log and drop it.
    Skip,
    /// Treat it as a protocol violation and close.
    Close,
}

/// Exponential backoff for sends against a full ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Upper bound on the total time a single send may spend backing off.
    pub fn total_budget(&self) -> Duration {
        (0..self.max_attempts).map(|a| self.delay(a)).sum()
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            max_attempts: 10,
        }
    }
}

/// Configuration shared by listeners and clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Directory under which namespaces are created.
    pub base_path: PathBuf,
    /// Slots created eagerly at listener startup.
    pub warm_pool_size: usize,
    /// Hard cap on slots; also the range of candidate ids a client tries.
    pub max_slots: usize,
    /// Bytes per ring direction (power of two).
    pub buffer_size: u32,
    pub backoff: BackoffConfig,
    /// Lock files older than this are considered stale.
    pub lock_max_age: Duration,
    /// Active slots idle for longer than this are reclaimed.
    pub slot_ttl: Duration,
    pub janitor_interval: Duration,
    pub accept_poll_interval: Duration,
    pub accept_queue_capacity: usize,
    pub connect_timeout: Duration,
    pub compression_threshold: usize,
    pub checksum_policy: ChecksumPolicy,
    pub unknown_type_policy: UnknownTypePolicy,
    /// Log a metrics summary at this interval; `None` disables reporting.
    pub metrics_report_interval: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            warm_pool_size: 4,
            max_slots: 64,
            buffer_size: 1024 * 1024,
            backoff: BackoffConfig::default(),
            lock_max_age: Duration::from_secs(60),
            slot_ttl: Duration::from_secs(300),
            janitor_interval: Duration::from_secs(5),
            accept_poll_interval: Duration::from_millis(1),
            accept_queue_capacity: 64,
            connect_timeout: Duration::from_secs(5),
            compression_threshold: shmlane_codec::DEFAULT_COMPRESSION_THRESHOLD,
            checksum_policy: ChecksumPolicy::Close,
            unknown_type_policy: UnknownTypePolicy::Deliver,
            metrics_report_interval: None,
        }
    }
}

fn default_base_path() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        env::temp_dir()
    }
}

impl TransportConfig {
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    /// Defaults overlaid with any `SHMLANE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`TransportConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = lookup("SHMLANE_BASE_PATH") {
            config.base_path = PathBuf::from(path);
        }
        if let Some(v) = parse_var(&lookup, "SHMLANE_WARM_POOL_SIZE")? {
            config.warm_pool_size = v;
        }
        if let Some(v) = parse_var(&lookup, "SHMLANE_MAX_SLOTS")? {
            config.max_slots = v;
        }
        if let Some(v) = parse_var(&lookup, "SHMLANE_BUFFER_SIZE")? {
            config.buffer_size = v;
        }
        if let Some(v) = parse_var(&lookup, "SHMLANE_BACKOFF_INITIAL_MS")? {
            config.backoff.initial = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "SHMLANE_BACKOFF_MAX_MS")? {
            config.backoff.max = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&lookup, "SHMLANE_BACKOFF_ATTEMPTS")? {
            config.backoff.max_attempts = v;
        }
        if let Some(v) = parse_var(&lookup, "SHMLANE_LOCK_MAX_AGE_SECS")? {
            config.lock_max_age = Duration::from_secs(v);
        }
        if let Some(v) = parse_var(&lookup, "SHMLANE_SLOT_TTL_SECS")? {
            config.slot_ttl = Duration::from_secs(v);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MIN_BUFFER_SIZE || !self.buffer_size.is_power_of_two() {
            return Err(ConfigError::InvalidBufferSize(self.buffer_size));
        }
        if self.max_slots == 0 {
            return Err(ConfigError::ZeroMaxSlots);
        }
        if self.warm_pool_size > self.max_slots {
            return Err(ConfigError::WarmPoolTooLarge {
                warm: self.warm_pool_size,
                max: self.max_slots,
            });
        }
        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::ZeroBackoffAttempts);
        }
        if self.backoff.initial > self.backoff.max {
            return Err(ConfigError::BackoffInverted {
                initial: self.backoff.initial,
                max: self.backoff.max,
            });
        }
        if self.accept_queue_capacity == 0 {
            return Err(ConfigError::ZeroAcceptQueue);
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { key, value: raw }),
    }
}

/// Builder for [`TransportConfig`].
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
        }
    }

    pub fn base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.base_path = path.into();
        self
    }

    pub fn warm_pool_size(mut self, n: usize) -> Self {
        self.config.warm_pool_size = n;
        self
    }

    pub fn max_slots(mut self, n: usize) -> Self {
        self.config.max_slots = n;
        self
    }

    pub fn buffer_size(mut self, bytes: u32) -> Self {
        self.config.buffer_size = bytes;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn lock_max_age(mut self, age: Duration) -> Self {
        self.config.lock_max_age = age;
        self
    }

    pub fn slot_ttl(mut self, ttl: Duration) -> Self {
        self.config.slot_ttl = ttl;
        self
    }

    pub fn janitor_interval(mut self, interval: Duration) -> Self {
        self.config.janitor_interval = interval;
        self
    }

    pub fn accept_poll_interval(mut self, interval: Duration) -> Self {
        self.config.accept_poll_interval = interval;
        self
    }

    pub fn accept_queue_capacity(mut self, n: usize) -> Self {
        self.config.accept_queue_capacity = n;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn compression_threshold(mut self, bytes: usize) -> Self {
        self.config.compression_threshold = bytes;
        self
    }

    pub fn checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.config.checksum_policy = policy;
        self
    }

    pub fn unknown_type_policy(mut self, policy: UnknownTypePolicy) -> Self {
        self.config.unknown_type_policy = policy;
        self
    }

    pub fn metrics_report_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.metrics_report_interval = interval;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidBufferSize(u32),
    ZeroMaxSlots,
    WarmPoolTooLarge { warm: usize, max: usize },
    ZeroBackoffAttempts,
    BackoffInverted { initial: Duration, max: Duration },
    ZeroAcceptQueue,
    InvalidVar { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBufferSize(size) => write!(
                f,
                "buffer size {size} must be a power of two of at least {MIN_BUFFER_SIZE}"
            ),
            Self::ZeroMaxSlots => write!(f, "max_slots must be at least 1"),
            Self::WarmPoolTooLarge { warm, max } => {
                write!(f, "warm pool size {warm} exceeds max slots {max}")
            }
            Self::ZeroBackoffAttempts => write!(f, "backoff needs at least one attempt"),
            Self::BackoffInverted { initial, max } => {
                write!(f, "initial backoff {initial:?} exceeds cap {max:?}")
            }
            Self::ZeroAcceptQueue => write!(f, "accept queue capacity must be at least 1"),
            Self::InvalidVar { key, value } => write!(f, "invalid value {value:?} for {key}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = TransportConfig::default();
        config.validate().unwrap();
        assert_eq!(config.warm_pool_size, 4);
        assert_eq!(config.max_slots, 64);
        assert_eq!(config.buffer_size, 1 << 20);
        assert_eq!(config.backoff.max_attempts, 10);
        assert_eq!(config.slot_ttl, Duration::from_secs(300));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(1));
        assert_eq!(backoff.delay(3), Duration::from_millis(8));
        assert_eq!(backoff.delay(7), Duration::from_millis(100));
        assert_eq!(backoff.delay(40), Duration::from_millis(100));
        // 1+2+4+8+16+32+64 + 3*100
        assert_eq!(backoff.total_budget(), Duration::from_millis(427));
    }

    #[test]
    fn builder_validates() {
        assert_eq!(
            TransportConfig::builder().buffer_size(5000).build().unwrap_err(),
            ConfigError::InvalidBufferSize(5000)
        );
        assert_eq!(
            TransportConfig::builder()
                .warm_pool_size(8)
                .max_slots(4)
                .build()
                .unwrap_err(),
            ConfigError::WarmPoolTooLarge { warm: 8, max: 4 }
        );
        let config = TransportConfig::builder()
            .buffer_size(1 << 16)
            .max_slots(2)
            .warm_pool_size(1)
            .build()
            .unwrap();
        assert_eq!(config.buffer_size, 65536);
    }

    #[test]
    fn env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("SHMLANE_BASE_PATH", "/tmp/shmlane-test"),
            ("SHMLANE_MAX_SLOTS", "8"),
            ("SHMLANE_WARM_POOL_SIZE", " 2 "),
            ("SHMLANE_BACKOFF_INITIAL_MS", "5"),
            ("SHMLANE_SLOT_TTL_SECS", "30"),
        ]
        .into_iter()
        .collect();
        let config =
            TransportConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.base_path, PathBuf::from("/tmp/shmlane-test"));
        assert_eq!(config.max_slots, 8);
        assert_eq!(config.warm_pool_size, 2);
        assert_eq!(config.backoff.initial, Duration::from_millis(5));
        assert_eq!(config.slot_ttl, Duration::from_secs(30));
    }

    #[test]
    fn env_rejects_garbage() {
        let err = TransportConfig::from_lookup(|k| {
            (k == "SHMLANE_BUFFER_SIZE").then(|| "lots".to_string())
        })
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidVar {
                key: "SHMLANE_BUFFER_SIZE",
                value: "lots".into()
            }
        );
    }
}
