//! Subscription Request Types
//!
//! A client subscription names a set of instruments and the instant from
//! which cached history should be replayed. The request is validated once
//! when the client connects and is immutable afterwards.

use chrono::{DateTime, Utc};

use super::observation::{Instrument, KEY_SEPARATOR, parse_timestamp};

/// A validated subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    instruments: Vec<Instrument>,
    start_time: DateTime<Utc>,
}

impl SubscriptionRequest {
    /// Validate raw request fields.
    ///
    /// Instrument codes are upper-cased and de-duplicated, keeping the order
    /// of first appearance. An empty `start_time` means `now`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] if no instruments are given, a code is blank
    /// or contains [`KEY_SEPARATOR`], or `start_time` is not RFC3339.
    pub fn parse<I, S>(
        instruments: I,
        start_time: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, RequestError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalised: Vec<Instrument> = Vec::new();
        for raw in instruments {
            let code = raw.as_ref().trim();
            if code.is_empty() {
                return Err(RequestError::BlankInstrument);
            }
            if code.contains(KEY_SEPARATOR) {
                return Err(RequestError::InvalidInstrument(code.to_string()));
            }
            let code = code.to_uppercase();
            if !normalised.contains(&code) {
                normalised.push(code);
            }
        }
        if normalised.is_empty() {
            return Err(RequestError::NoInstruments);
        }

        let start_time = if start_time.trim().is_empty() {
            now
        } else {
            parse_timestamp(start_time.trim())
                .map_err(|e| RequestError::InvalidStartTime(start_time.to_string(), e.to_string()))?
        };

        Ok(Self {
            instruments: normalised,
            start_time,
        })
    }

    /// The requested instruments, in request order.
    #[must_use]
    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    /// The instant from which history is replayed.
    #[must_use]
    pub const fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }
}

/// A rejected subscription request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// No instruments were requested.
    #[error("at least one instrument must be requested")]
    NoInstruments,
    /// An instrument code was empty.
    #[error("instrument codes cannot be blank")]
    BlankInstrument,
    /// An instrument code contains the history key separator.
    #[error("instrument code {0:?} cannot contain '@'")]
    InvalidInstrument(String),
    /// The start time is not RFC3339.
    #[error("invalid start time {0:?}: {1}")]
    InvalidStartTime(String, String),
}
