//! RFC 3339 timestamps in the `YYYY-MM-DDTHH:MM:SSZ` form used by every
//! expiry field and by the acquired annotation.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::Error;

const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Length of a timestamp in [`FORMAT`]
const FORMATTED_LEN: usize = 20;

/// Parse a UTC timestamp in `YYYY-MM-DDTHH:MM:SSZ` form.
///
/// Offsets, fractional seconds, and lowercase `z` are rejected.
pub fn parse(value: &str) -> Result<DateTime<Utc>, Error> {
    if value.len() != FORMATTED_LEN {
        return Err(Error::validation(format!(
            "timestamp {value:?} is not in YYYY-MM-DDTHH:MM:SSZ form"
        )));
    }
    NaiveDateTime::parse_from_str(value, FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::validation(format!("timestamp {value:?} is invalid: {e}")))
}

/// Format a time in `YYYY-MM-DDTHH:MM:SSZ` form
pub fn format(time: DateTime<Utc>) -> String {
    time.format(FORMAT).to_string()
}

/// Current time formatted for an annotation or status field
pub fn now() -> String {
    format(Utc::now())
}

/// Formatted time `ttl` from now
pub fn from_now(ttl: Duration) -> String {
    format(Utc::now() + ttl)
}

/// True when `value` is at or before `now`
pub fn is_past(value: &str, now: DateTime<Utc>) -> Result<bool, Error> {
    Ok(parse(value)? <= now)
}
