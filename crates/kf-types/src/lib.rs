#![forbid(unsafe_code)]

use std::sync::LazyLock;

use chrono::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unix timestamp in milliseconds. Signal hardware emits millisecond
/// resolution, so the whole workspace carries raw `i64` milliseconds instead
/// of a calendar type.
pub type TimestampMs = i64;

/// One time-stamped measurement of a raw signal or a derived KPI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub ts_ms: TimestampMs,
    pub value: f64,
}

impl Sample {
    #[must_use]
    pub fn new(ts_ms: TimestampMs, value: f64) -> Self {
        Self { ts_ms, value }
    }
}

impl From<(TimestampMs, f64)> for Sample {
    fn from((ts_ms, value): (TimestampMs, f64)) -> Self {
        Self { ts_ms, value }
    }
}

/// Expression-language truthiness for plain numbers: zero is false,
/// everything else (including NaN) is true.
#[must_use]
pub fn is_truthy(value: f64) -> bool {
    value != 0.0
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeError {
    #[error("duration must be positive, got {ms}ms")]
    NonPositiveDuration { ms: i64 },
}

static DURATION_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(ms|s|m|h|d)$").expect("duration literal pattern is valid"));

/// Parse a duration literal such as `"500ms"`, `"1s"`, `"3m"`, `"7h"` or
/// `"8d"`. Anything outside the grammar returns `None`; callers treat such
/// text as an ordinary string, not a malformed duration.
#[must_use]
pub fn parse_duration_literal(text: &str) -> Option<Duration> {
    let caps = DURATION_LITERAL.captures(text)?;
    let amount: i64 = caps[1].parse().ok()?;
    match &caps[2] {
        "ms" => Some(Duration::milliseconds(amount)),
        "s" => Duration::try_seconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        _ => None,
    }
}

/// Millisecond width of a window duration, validated positive.
pub fn duration_width_ms(duration: Duration) -> Result<i64, TimeError> {
    let ms = duration.num_milliseconds();
    if ms <= 0 {
        return Err(TimeError::NonPositiveDuration { ms });
    }
    Ok(ms)
}
