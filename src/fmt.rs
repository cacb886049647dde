//! Provides parsing and formatting helpers for durations.
//!
//! TTLs in the config are either given as plain number of seconds or as duration expressions
//! like "15m" or "500ms". The formatting helper is used when reporting TTLs in the logs.
use std::fmt::Write;
use std::time::Duration;

const MILLIS_PER_SECOND: u128 = 1000;
const MILLIS_PER_MINUTE: u128 = 60 * MILLIS_PER_SECOND;
const MILLIS_PER_HOUR: u128 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: u128 = 24 * MILLIS_PER_HOUR;

/// Parses a duration from a given string.
///
/// The number can be followed by one of these suffixes (either lower or upper case):
/// * **ms**: milliseconds
/// * **s**: seconds
/// * **m**: minutes
/// * **h**: hours
/// * **d**: days
///
/// A number without suffix is treated as seconds, as this is the unit of all TTLs.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(courier::fmt::parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert_eq!(courier::fmt::parse_duration("12").unwrap(), Duration::from_secs(12));
/// assert_eq!(courier::fmt::parse_duration("12 S").unwrap(), Duration::from_secs(12));
/// assert_eq!(courier::fmt::parse_duration("15m").unwrap(), Duration::from_secs(15 * 60));
/// assert_eq!(courier::fmt::parse_duration("2h").unwrap(), Duration::from_secs(2 * 60 * 60));
/// assert_eq!(courier::fmt::parse_duration("1d").unwrap(), Duration::from_secs(24 * 60 * 60));
///
/// assert_eq!(courier::fmt::parse_duration("3 weeks").is_err(), true);
/// assert_eq!(courier::fmt::parse_duration("1.5s").is_err(), true);
/// assert_eq!(courier::fmt::parse_duration("-1s").is_err(), true);
/// assert_eq!(courier::fmt::parse_duration("999999999999999999d").is_err(), true);
/// ```
pub fn parse_duration(str: impl AsRef<str>) -> anyhow::Result<Duration> {
    lazy_static::lazy_static! {
        static ref NUMBER_AND_UNIT: regex::Regex =
            regex::Regex::new(r"^ *(\d+) *(ms|MS|s|S|m|M|h|H|d|D)? *$").unwrap();
    }

    let captures = NUMBER_AND_UNIT.captures(str.as_ref()).ok_or_else(|| {
        anyhow::anyhow!(
            "Cannot parse '{}' into a duration. \
             Expected a positive number optionally followed by 'ms', 's', 'm', 'h' or 'd'.",
            str.as_ref()
        )
    })?;

    let number = captures[1].parse::<u64>()?;
    let unit = captures
        .get(2)
        .map(|unit| unit.as_str().to_lowercase())
        .unwrap_or_default();

    let factor = match unit.as_str() {
        "ms" => return Ok(Duration::from_millis(number)),
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => 1,
    };

    number
        .checked_mul(factor)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("The duration '{}' is too large.", str.as_ref()))
}

/// Formats a duration into a string like "1d 3h 17m 2s 12ms".
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// assert_eq!(courier::fmt::format_duration(Duration::from_millis(13)), "13ms");
/// assert_eq!(courier::fmt::format_duration(Duration::from_millis(62_013)), "1m 2s 13ms");
/// assert_eq!(courier::fmt::format_duration(Duration::from_secs(210)), "3m 30s");
/// assert_eq!(courier::fmt::format_duration(Duration::from_secs(25 * 60 * 60)), "1d 1h");
/// assert_eq!(courier::fmt::format_duration(Duration::ZERO), "0ms");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let mut value = duration.as_millis();
    if value == 0 {
        return "0ms".to_owned();
    }

    let mut result = String::new();
    for (unit, millis) in [
        ("d", MILLIS_PER_DAY),
        ("h", MILLIS_PER_HOUR),
        ("m", MILLIS_PER_MINUTE),
        ("s", MILLIS_PER_SECOND),
        ("ms", 1),
    ] {
        let amount = value / millis;
        if amount > 0 {
            if !result.is_empty() {
                result.push(' ');
            }
            let _ = write!(result, "{}{}", amount, unit);
            value %= millis;
        }
    }

    result
}
