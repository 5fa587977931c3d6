use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Attribution event categories as they appear in the warehouse's
/// `event_name` column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Install,
    TrialStarted,
    SubscribeActivated,
    TrialRenewalCancelled,
}

impl EventName {
    /// Every category the relay consumes, in warehouse filter order.
    pub const ALL: [Self; 4] = [
        Self::Install,
        Self::TrialStarted,
        Self::SubscribeActivated,
        Self::TrialRenewalCancelled,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::TrialStarted => "af_start_trial",
            Self::SubscribeActivated => "af_subscribe",
            Self::TrialRenewalCancelled => "trial_renewal_cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "install" => Some(Self::Install),
            "af_start_trial" => Some(Self::TrialStarted),
            "af_subscribe" => Some(Self::SubscribeActivated),
            "trial_renewal_cancelled" => Some(Self::TrialRenewalCancelled),
            _ => None,
        }
    }
}

/// One warehouse row. Immutable once fetched; the watermark guarantees a
/// counted row is never fetched again.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Event {
    pub event_time: OffsetDateTime,
    pub event_name: EventName,
    pub subscriber_id: String,
}

/// A fetched batch partitioned by event category.
///
/// The partition is total and disjoint: every event lands in exactly one
/// group, none are mutated.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ClassifiedBatch {
    pub installs: Vec<Event>,
    pub trial_starts: Vec<Event>,
    pub activations: Vec<Event>,
    pub trial_cancellations: Vec<Event>,
}

impl ClassifiedBatch {
    #[must_use]
    pub fn total(&self) -> usize {
        self.installs.len()
            + self.trial_starts.len()
            + self.activations.len()
            + self.trial_cancellations.len()
    }
}

#[must_use]
pub fn classify(events: Vec<Event>) -> ClassifiedBatch {
    let mut batch = ClassifiedBatch::default();
    for event in events {
        match event.event_name {
            EventName::Install => batch.installs.push(event),
            EventName::TrialStarted => batch.trial_starts.push(event),
            EventName::SubscribeActivated => batch.activations.push(event),
            EventName::TrialRenewalCancelled => batch.trial_cancellations.push(event),
        }
    }
    batch
}

/// What a cycle should do given the persisted watermark and the warehouse's
/// current qualifying row count.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeltaPlan {
    /// Counts match. The cycle ends with no further work and the watermark
    /// is left untouched.
    NoNewRows,

    /// `limit` new rows exist past the watermark; fetch exactly that many
    /// newest rows.
    Fetch { limit: u64 },

    /// The warehouse reports fewer rows than the watermark (truncated or
    /// rotated). A negative delta must never be computed; the caller resets
    /// the watermark to `current_total` and processes zero events.
    Inconsistent { watermark: u64, current_total: u64 },
}

#[must_use]
pub fn plan_delta(watermark: u64, current_total: u64) -> DeltaPlan {
    if current_total == watermark {
        return DeltaPlan::NoNewRows;
    }
    if current_total < watermark {
        return DeltaPlan::Inconsistent {
            watermark,
            current_total,
        };
    }
    DeltaPlan::Fetch {
        limit: current_total - watermark,
    }
}

/// Outbound `cnv_status` vocabulary of the tracking endpoint.
///
/// Each status owns a fixed tracking slot selecting the `event<N>=1` query
/// parameter. The endpoint defines all four; the relay currently emits
/// `Install`, `TrialStarted` (confirmed trials) and `TrialConverted`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Install,
    TrialStarted,
    TrialRenewalCancelled,
    TrialConverted,
}

impl ConversionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::TrialStarted => "trial_started",
            Self::TrialRenewalCancelled => "trial_renewal_cancelled",
            Self::TrialConverted => "trial_converted",
        }
    }

    #[must_use]
    pub fn event_slot(self) -> u8 {
        match self {
            Self::Install => 1,
            Self::TrialStarted => 2,
            Self::TrialRenewalCancelled => 3,
            Self::TrialConverted => 4,
        }
    }

    /// Query parameter key for this status, e.g. `event2`.
    #[must_use]
    pub fn event_param(self) -> String {
        format!("event{}", self.event_slot())
    }
}

/// Fixed-delay retry policy for outbound postbacks.
///
/// Every failure kind is retried identically; transient and non-transient
/// failures are deliberately not distinguished.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_secs(6),
        }
    }
}

impl RetryPolicy {
    /// # Errors
    /// Returns [`CoreError::Configuration`] when the policy would never
    /// attempt a call.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.attempts == 0 {
            return Err(CoreError::Configuration(
                "retry attempts MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A trial awaiting confirmation or cancellation, keyed by subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PendingTrial {
    pub subscriber_id: String,
    pub event_time: OffsetDateTime,
    pub event_name: EventName,
    pub inserted_at: OffsetDateTime,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CoreError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CoreError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CoreError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CoreError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Parses a warehouse `DateTime` value, interpreted as UTC.
///
/// The warehouse serializes timestamps as `YYYY-MM-DD HH:MM:SS`; RFC3339 is
/// accepted as a fallback.
///
/// # Errors
/// Returns [`CoreError::Validation`] when the value matches neither shape.
pub fn parse_warehouse_datetime(value: &str) -> Result<OffsetDateTime, CoreError> {
    let format =
        time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").map_err(
            |err| CoreError::Validation(format!("invalid datetime format description: {err}")),
        )?;

    match PrimitiveDateTime::parse(value, &format) {
        Ok(parsed) => Ok(parsed.assume_utc()),
        Err(_) => parse_rfc3339_utc(value)
            .map_err(|_| CoreError::Validation(format!("invalid warehouse timestamp: {value}"))),
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
