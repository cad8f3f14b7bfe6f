use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::info;
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::error::LapseError;

/// Parse a duration such as `"1000ms"`, `"5s"` or `"2min"`.
///
/// A bare number is taken as milliseconds.
pub fn parse_duration(value: &str) -> Result<Duration, LapseError> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let invalid = |reason: &str| LapseError::InvalidParameter {
        name: "duration",
        reason: format!("{value:?}: {reason}"),
    };

    let number: f64 = number.parse().map_err(|_| invalid("not a number"))?;
    let unit_nanos = match unit.trim() {
        "h" => 3_600e9,
        "min" => 60e9,
        "s" | "sec" => 1e9,
        "" | "ms" => 1e6,
        "us" => 1e3,
        "ns" => 1.0,
        _ => return Err(invalid("unknown unit")),
    };

    let nanos = (number * unit_nanos).round();
    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return Err(invalid("out of range"));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// Find the first capture node that can deliver planar YUV420.
pub fn auto_detect_device() -> Result<String> {
    use std::path::Path;

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            if formats.iter().any(|fmt| fmt.fourcc == FourCC::new(b"YU12")) {
                info!("Found YUV420 device: {} - {}", path, caps.card);
                return Ok(path);
            }
        }
    }

    Err(eyre!("No suitable capture device found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_with_units() {
        assert_eq!(parse_duration("1000ms").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2min").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
    }

    #[test]
    fn bare_number_is_milliseconds() {
        assert_eq!(parse_duration("1500").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10 parsecs").is_err());
    }
}
