use appeals_core::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LIVENESS_DEADLINE: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONTROL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub url: Url,
    /// Zero disables liveness probing.
    pub heartbeat_interval: Duration,
    /// Must be shorter than `heartbeat_interval`.
    pub liveness_deadline: Duration,
    pub retry_delay: Duration,
    /// Upper bound on one connect attempt, handshake included.
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub control_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unsupported url scheme '{0}', expected ws or wss")]
    Scheme(String),
    #[error("retry delay must be greater than zero")]
    ZeroRetryDelay,
    #[error("liveness deadline must be greater than zero while heartbeat is enabled")]
    ZeroLivenessDeadline,
    #[error("liveness deadline {deadline:?} must be shorter than heartbeat interval {interval:?}")]
    DeadlineNotBeforeInterval { deadline: Duration, interval: Duration },
    #[error("connect timeout must be greater than zero")]
    ZeroConnectTimeout,
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
}

impl StreamConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            liveness_deadline: DEFAULT_LIVENESS_DEADLINE,
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            control_capacity: DEFAULT_CONTROL_CAPACITY,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConfigError::Scheme(other.to_string())),
        }
        if self.retry_delay.is_zero() {
            return Err(ConfigError::ZeroRetryDelay);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroConnectTimeout);
        }
        if !self.heartbeat_interval.is_zero() {
            if self.liveness_deadline.is_zero() {
                return Err(ConfigError::ZeroLivenessDeadline);
            }
            if self.liveness_deadline >= self.heartbeat_interval {
                return Err(ConfigError::DeadlineNotBeforeInterval {
                    deadline: self.liveness_deadline,
                    interval: self.heartbeat_interval,
                });
            }
        }
        if self.control_capacity == 0 {
            return Err(ConfigError::ZeroCapacity("control_capacity"));
        }
        Ok(())
    }
}
