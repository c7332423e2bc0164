//! Redis Adapters
//!
//! - [`RedisHistoryStore`]: history cache as string values plus one sorted
//!   set (`times`) scored by Unix seconds
//! - [`RedisFanout`]: per-instrument pub/sub channels named
//!   `<prefix><INSTRUMENT>` carrying JSON `{timedate, price}`

mod fanout;
mod history;

pub use fanout::{FanoutMessage, RedisFanout};
pub use history::{RedisHistoryStore, TIME_INDEX_KEY};

/// Build a `redis://` URL from the split address, password and database
/// settings.
#[must_use]
pub fn connection_url(addr: &str, password: &str, db: i64) -> String {
    if password.is_empty() {
        format!("redis://{addr}/{db}")
    } else {
        format!("redis://:{password}@{addr}/{db}")
    }
}
