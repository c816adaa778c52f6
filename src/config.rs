use std::env;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_POOL_SIZE: usize = 5;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_RECONNECT_AFTER: Duration = Duration::from_secs(3);

/// Per-connection behavior knobs.
#[derive(Debug, Clone)]
pub struct Options {
    /// How long a TCP connect may take before it counts as failed.
    pub connect_timeout: Duration,
    /// Delay before reconnecting after a lost connection or failed
    /// connect; `None` disables reconnecting.
    pub reconnect_after: Option<Duration>,
    /// Whether pipelines that open with MULTI get an EXEC appended
    /// automatically on send.
    pub auto_close_transaction: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_after: Some(DEFAULT_RECONNECT_AFTER),
            auto_close_transaction: true,
        }
    }
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub options: Options,
    /// Number of pool members for [`create_pool`](crate::create_pool);
    /// `None` means the default size.
    pub pool_size: Option<usize>,
}

impl Default for RedisConfig {
    fn default() -> RedisConfig {
        RedisConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            options: Options::default(),
            pool_size: None,
        }
    }
}

impl RedisConfig {
    pub fn new(host: impl Into<String>, port: u16) -> RedisConfig {
        RedisConfig {
            host: host.into(),
            port,
            ..RedisConfig::default()
        }
    }

    /// Builds a config from `REDIS_HOST` / `REDIS_PORT` / `REDIS_POOL_SIZE`.
    /// Returns `None` when neither host nor port is set; a set
    /// `REDIS_POOL_SIZE` marks the config as pool-shaped.
    pub fn from_env() -> Option<RedisConfig> {
        let host = env::var("REDIS_HOST").ok();
        let port = env::var("REDIS_PORT").ok().and_then(|p| p.parse().ok());
        if host.is_none() && port.is_none() {
            return None;
        }
        let pool_size = env::var("REDIS_POOL_SIZE").ok().and_then(|s| s.parse().ok());
        Some(RedisConfig {
            host: host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: port.unwrap_or(DEFAULT_PORT),
            options: Options::default(),
            pool_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6379);
        assert_eq!(config.pool_size, None);
        assert_eq!(config.options.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.options.reconnect_after, Some(Duration::from_secs(3)));
        assert!(config.options.auto_close_transaction);
    }

    #[test]
    fn test_from_env() {
        env::set_var("REDIS_HOST", "10.0.0.7");
        env::set_var("REDIS_PORT", "6380");
        env::set_var("REDIS_POOL_SIZE", "3");
        let config = RedisConfig::from_env().unwrap();
        assert_eq!(config.host, "10.0.0.7");
        assert_eq!(config.port, 6380);
        assert_eq!(config.pool_size, Some(3));
        env::remove_var("REDIS_HOST");
        env::remove_var("REDIS_PORT");
        env::remove_var("REDIS_POOL_SIZE");
        assert!(RedisConfig::from_env().is_none());
    }
}
