use std::time::Duration;

use super::{Error, RawDuration, RawMemory};

/// Parses a config duration. `"0ms"` and `0` both produce `None`,
/// meaning "no timeout".
pub fn parse_duration(raw: &RawDuration) -> Result<Option<Duration>, Error> {
    let duration = match raw {
        RawDuration::Millis(ms) => Duration::from_millis(*ms),
        RawDuration::Text(text) => {
            humantime::parse_duration(text.trim()).map_err(|_| Error::InvalidDuration {
                value: text.clone(),
            })?
        }
    };
    Ok((!duration.is_zero()).then_some(duration))
}

/// Parses a memory size into bytes. Suffixes are powers of 1024.
pub fn parse_memory(raw: &RawMemory) -> Result<u64, Error> {
    let text = match raw {
        RawMemory::Bytes(bytes) => return Ok(*bytes),
        RawMemory::Text(text) => text.trim(),
    };

    let invalid = || Error::InvalidMemory {
        value: text.to_string(),
    };

    let (digits, multiplier) = if let Some(number) = text.strip_suffix("GB") {
        (number, 1024u64 * 1024 * 1024)
    } else if let Some(number) = text.strip_suffix("MB") {
        (number, 1024 * 1024)
    } else if let Some(number) = text.strip_suffix("KB") {
        (number, 1024)
    } else if let Some(number) = text.strip_suffix('B') {
        (number, 1)
    } else {
        (text, 1)
    };

    let amount: u64 = digits.trim().parse().map_err(|_| invalid())?;
    amount.checked_mul(multiplier).ok_or_else(invalid)
}
