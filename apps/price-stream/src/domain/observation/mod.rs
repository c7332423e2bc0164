//! Price Observation Types
//!
//! Core domain types for a single priced observation of an instrument and
//! the deterministic key used to cache it.
//!
//! # Key Format
//!
//! ```text
//! <INSTRUMENT>@<RFC3339 timestamp>      e.g.  USD@2024-01-01T00:00:00Z
//! ```
//!
//! The same key is stored as the value's lookup key and as the member of
//! the time index, scored by the observation's Unix timestamp.

use std::fmt;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Separator between the instrument and the timestamp in a [`HistoryKey`].
pub const KEY_SEPARATOR: char = '@';

/// An instrument code such as `USD` or `EUR`.
pub type Instrument = String;

// =============================================================================
// Price Observation
// =============================================================================

/// One price of one instrument at one instant. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    instrument: Instrument,
    timestamp: DateTime<Utc>,
    price: f64,
}

impl PriceObservation {
    /// Create an observation. The timestamp is truncated to whole seconds so
    /// that it survives a round trip through its [`HistoryKey`].
    #[must_use]
    pub fn new(instrument: impl Into<Instrument>, timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            instrument: instrument.into(),
            timestamp: timestamp.trunc_subsecs(0),
            price,
        }
    }

    /// The observed instrument.
    #[must_use]
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// When the price was observed.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The observed price.
    #[must_use]
    pub const fn price(&self) -> f64 {
        self.price
    }

    /// The cache key for this observation.
    #[must_use]
    pub fn key(&self) -> HistoryKey {
        HistoryKey::new(&self.instrument, self.timestamp)
    }

    /// RFC3339 rendering of the timestamp, as used on the wire.
    #[must_use]
    pub fn timedate(&self) -> String {
        format_timestamp(self.timestamp)
    }
}

// =============================================================================
// History Key
// =============================================================================

/// Deterministic cache key derived from `(instrument, timestamp)`.
///
/// Two observations with the same instrument and timestamp share a key, so a
/// later write overwrites the earlier price.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HistoryKey(String);

impl HistoryKey {
    /// Build the key for an instrument at a timestamp.
    #[must_use]
    pub fn new(instrument: &str, timestamp: DateTime<Utc>) -> Self {
        Self(format!(
            "{instrument}{KEY_SEPARATOR}{}",
            format_timestamp(timestamp)
        ))
    }

    /// Parse a raw key read back from the store.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the separator is missing, the instrument is
    /// empty, or the timestamp is not valid RFC3339.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let (instrument, timedate) = raw
            .split_once(KEY_SEPARATOR)
            .ok_or_else(|| KeyError::MissingSeparator(raw.to_string()))?;
        if instrument.is_empty() {
            return Err(KeyError::EmptyInstrument(raw.to_string()));
        }
        parse_timestamp(timedate).map_err(|_| KeyError::InvalidTimestamp(raw.to_string()))?;
        Ok(Self(raw.to_string()))
    }

    /// The key prefix shared by every key of `instrument`.
    #[must_use]
    pub fn prefix(instrument: &str) -> String {
        format!("{instrument}{KEY_SEPARATOR}")
    }

    /// Whether this key belongs to `instrument`.
    #[must_use]
    pub fn belongs_to(&self, instrument: &str) -> bool {
        self.0
            .strip_prefix(instrument)
            .is_some_and(|rest| rest.starts_with(KEY_SEPARATOR))
    }

    /// The instrument part of the key.
    #[must_use]
    pub fn instrument(&self) -> &str {
        self.0
            .split_once(KEY_SEPARATOR)
            .map_or(self.0.as_str(), |(instrument, _)| instrument)
    }

    /// The timestamp part of the key.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.0
            .split_once(KEY_SEPARATOR)
            .and_then(|(_, timedate)| parse_timestamp(timedate).ok())
    }

    /// The raw key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve the key back into an observation using the stored price.
    #[must_use]
    pub fn into_observation(self, price: f64) -> Option<PriceObservation> {
        let timestamp = self.timestamp()?;
        Some(PriceObservation::new(self.instrument(), timestamp, price))
    }
}

impl fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A malformed [`HistoryKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The key has no `@` separator.
    #[error("history key {0:?} has no separator")]
    MissingSeparator(String),
    /// The key has an empty instrument.
    #[error("history key {0:?} has an empty instrument")]
    EmptyInstrument(String),
    /// The key's timestamp is not RFC3339.
    #[error("history key {0:?} has an invalid timestamp")]
    InvalidTimestamp(String),
}

// =============================================================================
// Timestamp helpers
// =============================================================================

/// Render a timestamp as second-precision RFC3339 in UTC (`...Z`).
#[must_use]
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC3339 timestamp into UTC.
///
/// # Errors
///
/// Returns the chrono parse error for anything that is not RFC3339.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

// =============================================================================
// Tests
// =============================================================================
