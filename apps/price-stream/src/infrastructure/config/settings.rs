//! Service Configuration Settings
//!
//! Configuration types for the price stream service, loaded from
//! environment variables.

use std::time::Duration;

use crate::application::services::PipelineConfig;
use crate::infrastructure::coindesk::DEFAULT_QUOTE_URL;
use crate::infrastructure::grpc::PriceStreamServerConfig;
use crate::infrastructure::redis::connection_url;

/// Backing services for history and fanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Redis history store and Redis pub/sub fanout.
    #[default]
    Redis,
    /// In-process store and broadcast fanout; nothing survives a restart.
    Memory,
}

impl Backend {
    /// Parse a backend name, ignoring case.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Some(Self::Redis),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }

    /// Backend name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

/// History cache connection settings.
#[derive(Clone)]
pub struct RedisSettings {
    /// `host:port` of the cache.
    pub addr: String,
    /// Cache password; empty for none.
    pub password: String,
    /// Database index.
    pub db: i64,
}

impl RedisSettings {
    /// Connection URL for the cache.
    #[must_use]
    pub fn url(&self) -> String {
        connection_url(&self.addr, &self.password, self.db)
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            addr: "redis:6379".to_string(),
            password: String::new(),
            db: 0,
        }
    }
}

impl std::fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSettings")
            .field("addr", &self.addr)
            .field(
                "password",
                &if self.password.is_empty() { "" } else { "[REDACTED]" },
            )
            .field("db", &self.db)
            .finish()
    }
}

/// Fanout broker settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Broker URL.
    pub url: String,
    /// Channel name prefix; channels are `<prefix><INSTRUMENT>`.
    pub channel_prefix: String,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "redis://redis:6379/0".to_string(),
            channel_prefix: "btcprice".to_string(),
        }
    }
}

/// Upstream polling settings.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Interval between polls of one instrument.
    pub interval: Duration,
    /// Quote endpoint URL.
    pub quote_url: String,
    /// Per-request timeout.
    pub fetch_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
            quote_url: DEFAULT_QUOTE_URL.to_string(),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// gRPC server port.
    pub grpc_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            grpc_port: 50051,
            health_port: 8081,
        }
    }
}

/// Subscription limits.
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    /// Maximum concurrently open subscriptions.
    pub max_subscriptions: usize,
    /// Per-subscription buffer between producers and the client.
    pub delivery_buffer: usize,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            max_subscriptions: 1024,
            delivery_buffer: 256,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    /// Which backends to use.
    pub backend: Backend,
    /// History cache settings.
    pub redis: RedisSettings,
    /// Fanout broker settings.
    pub broker: BrokerSettings,
    /// Upstream polling settings.
    pub poll: PollSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Subscription limits.
    pub subscriptions: SubscriptionSettings,
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// Unparsable numbers fall back to their defaults; zero buffers and
    /// limits are rejected, as are poll intervals under one second.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an unknown backend, a zero
    /// buffer or limit, or a sub-second poll interval.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let backend = match env.get("PRICE_STREAM_BACKEND") {
            Some(raw) => Backend::from_str_case_insensitive(&raw).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "PRICE_STREAM_BACKEND".to_string(),
                    message: format!("unknown backend {raw:?}, expected redis or memory"),
                }
            })?,
            None => defaults.backend,
        };

        let redis = RedisSettings {
            addr: env.string("REDIS_ADDR", defaults.redis.addr),
            password: env.string("REDIS_PASSWORD", defaults.redis.password),
            db: env.parsed("REDIS_DB", defaults.redis.db),
        };

        let broker = BrokerSettings {
            url: env.string("BROKER_URL", defaults.broker.url),
            channel_prefix: env.string(
                "PRICE_STREAM_CHANNEL_PREFIX",
                defaults.broker.channel_prefix,
            ),
        };

        let poll = PollSettings {
            interval: Duration::from_millis(poll_interval_ms(env.parsed(
                "PRICE_STREAM_POLL_INTERVAL_MS",
                u64::try_from(defaults.poll.interval.as_millis()).unwrap_or(5_000),
            ))?),
            quote_url: env.string("PRICE_STREAM_QUOTE_URL", defaults.poll.quote_url),
            fetch_timeout: Duration::from_secs(env.parsed(
                "PRICE_STREAM_FETCH_TIMEOUT_SECS",
                defaults.poll.fetch_timeout.as_secs(),
            )),
        };

        let server = ServerSettings {
            grpc_port: env.parsed("PRICE_STREAM_GRPC_PORT", defaults.server.grpc_port),
            health_port: env.parsed("PRICE_STREAM_HEALTH_PORT", defaults.server.health_port),
        };

        let subscriptions = SubscriptionSettings {
            max_subscriptions: non_zero(
                "PRICE_STREAM_MAX_SUBSCRIPTIONS",
                env.parsed(
                    "PRICE_STREAM_MAX_SUBSCRIPTIONS",
                    defaults.subscriptions.max_subscriptions,
                ),
            )?,
            delivery_buffer: non_zero(
                "PRICE_STREAM_DELIVERY_BUFFER",
                env.parsed(
                    "PRICE_STREAM_DELIVERY_BUFFER",
                    defaults.subscriptions.delivery_buffer,
                ),
            )?,
        };

        Ok(Self {
            backend,
            redis,
            broker,
            poll,
            server,
            subscriptions,
        })
    }

    /// Pipeline tuning derived from this configuration.
    #[must_use]
    pub const fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            poll_interval: self.poll.interval,
            delivery_buffer: self.subscriptions.delivery_buffer,
        }
    }

    /// gRPC server configuration derived from this configuration.
    #[must_use]
    pub const fn grpc(&self) -> PriceStreamServerConfig {
        PriceStreamServerConfig {
            max_subscriptions: self.subscriptions.max_subscriptions,
            delivery_buffer: self.subscriptions.delivery_buffer,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable is present but unusable.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        message: String,
    },
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).unwrap_or(default)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

fn non_zero<T>(key: &str, value: T) -> Result<T, ConfigError>
where
    T: Default + PartialEq,
{
    if value == T::default() {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        })
    } else {
        Ok(value)
    }
}

/// Observations carry whole-second timestamps, so two polls within one
/// second would share a timestamp and the later one would be dropped as a
/// duplicate by live subscribers.
const MIN_POLL_INTERVAL_MS: u64 = 1_000;

fn poll_interval_ms(value: u64) -> Result<u64, ConfigError> {
    if value < MIN_POLL_INTERVAL_MS {
        return Err(ConfigError::InvalidValue {
            key: "PRICE_STREAM_POLL_INTERVAL_MS".to_string(),
            message: format!("must be at least {MIN_POLL_INTERVAL_MS}"),
        });
    }
    Ok(value)
}
