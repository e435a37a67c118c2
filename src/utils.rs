//! Utility functions for formatting and timestamps
use time::macros::format_description;
use time::OffsetDateTime;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let format = format_description!("[day].[month].[year] - [hour]:[minute]:[second]");
    dt.format(format).unwrap_or_else(|_| dt.to_string())
}

/// Current wall clock time as whole seconds since the Unix epoch
///
/// The plug protocol stamps every command with this value.
pub fn unix_timestamp() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Human-readable label for a power state
pub fn on_off(power_on: bool) -> &'static str {
    if power_on {
        "ON"
    } else {
        "OFF"
    }
}
