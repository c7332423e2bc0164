//! Configuration Module
//!
//! Configuration loading for the price stream service.

mod settings;

pub use settings::{
    Backend, BrokerSettings, ConfigError, PollSettings, RedisSettings, ServerSettings,
    StreamConfig, SubscriptionSettings,
};
