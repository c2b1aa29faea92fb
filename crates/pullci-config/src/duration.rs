//! Durations written the way operators write them: `30m`, `1h30m`, `45s`,
//! `500ms`. A bare number is seconds.

use std::time::Duration;

use crate::{ConfigError, ConfigResult};

pub fn parse_duration(field: &str, input: &str) -> ConfigResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConfigError::invalid(field, "empty duration"));
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(ConfigError::invalid(
                field,
                format!("expected a number in '{}'", input),
            ));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| ConfigError::invalid(field, format!("{}: {}", input, e)))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 60 * 60),
            "" => {
                return Err(ConfigError::invalid(
                    field,
                    format!("missing unit in '{}'", input),
                ));
            }
            other => {
                return Err(ConfigError::invalid(
                    field,
                    format!("unknown unit '{}' (expected ms, s, m or h)", other),
                ));
            }
        };
        total += part;
    }
    Ok(total)
}
