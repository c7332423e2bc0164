//! Client connection setup.
//!
//! Connection attempts are retried a fixed number of times with a fixed
//! delay between them. An established stream that later fails is not
//! resumed.

use std::time::Duration;

use tonic::transport::Channel;

use super::proto::price::v1::price_service_client::PriceServiceClient;

/// Fixed-delay retry policy for connection setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPolicy {
    /// Total connection attempts, at least one.
    pub attempts: u32,
    /// Delay between attempts.
    pub backoff: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

impl ConnectPolicy {
    /// Delay before retrying after failed attempt number `attempt` (1-based),
    /// or `None` once attempts are used up.
    #[must_use]
    pub const fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.attempts {
            None
        } else {
            Some(self.backoff)
        }
    }
}

/// Connection setup failure.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The address is not a valid endpoint URI.
    #[error("invalid server address {addr}: {message}")]
    InvalidAddress {
        /// The rejected address.
        addr: String,
        /// Parse error.
        message: String,
    },
    /// Every attempt failed.
    #[error("failed to connect to {addr} after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Server address.
        addr: String,
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last_error: String,
    },
}

/// Connect to the price service at `addr`, retrying per `policy`.
///
/// # Errors
///
/// Returns `ConnectError::InvalidAddress` for a malformed address, or
/// `ConnectError::Exhausted` once every attempt has failed.
pub async fn connect_with_retry(
    addr: &str,
    policy: ConnectPolicy,
) -> Result<PriceServiceClient<Channel>, ConnectError> {
    let endpoint = Channel::from_shared(addr.to_string()).map_err(|e| ConnectError::InvalidAddress {
        addr: addr.to_string(),
        message: e.to_string(),
    })?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match endpoint.connect().await {
            Ok(channel) => {
                tracing::info!(addr, attempt, "Connected to price service");
                return Ok(PriceServiceClient::new(channel));
            }
            Err(e) => match policy.delay_after(attempt) {
                Some(delay) => {
                    tracing::warn!(
                        addr,
                        attempt,
                        error = %e,
                        retry_in_secs = delay.as_secs_f64(),
                        "Connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(ConnectError::Exhausted {
                        addr: addr.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
            },
        }
    }
}
