//! Clock-time (`HH:MM:SS`) parsing and normalization
//!
//! Flagged snippet windows arrive from the detection model as loosely
//! formatted clock offsets ("SS", "M:SS", "HH:MM:SS", ...). Everything
//! stored in the snippets table is normalized to `HH:MM:SS`.

use crate::{Error, Result};

/// Normalize a clock-time string to `HH:MM:SS` by left-padding missing
/// components with zeros.
///
/// "7" becomes "00:00:7", "3:05" becomes "00:3:05"; components are not
/// re-padded individually, matching the storage convention.
pub fn normalize(time_str: &str) -> Result<String> {
    let s = time_str.trim();
    if s.is_empty() {
        return Err(Error::Data(
            "Invalid time format. Expected format: 'HH:MM:SS'".into(),
        ));
    }

    match s.matches(':').count() {
        0 => Ok(format!("00:00:{}", s)),
        1 => Ok(format!("00:{}", s)),
        2 => Ok(s.to_string()),
        _ => Err(Error::Data(
            "Invalid time format. Expected format: 'HH:MM:SS'".into(),
        )),
    }
}

/// Convert a clock-time string to whole seconds.
///
/// Supports "HH:MM:SS", "MM:SS" and bare "SS", with fractional seconds
/// rounded to the nearest whole second.
pub fn to_seconds(time_str: &str) -> Result<u32> {
    let s = time_str.trim();
    let parts: Vec<&str> = s.split(':').collect();

    let parse = |p: &str| -> Result<f64> {
        p.parse::<f64>()
            .map_err(|_| Error::Data(format!("Invalid time component: '{}'", p)))
    };

    let total = match parts.as_slice() {
        [h, m, sec] => parse(h)? * 3600.0 + parse(m)? * 60.0 + parse(sec)?,
        [m, sec] => parse(m)? * 60.0 + parse(sec)?,
        [sec] => parse(sec)?,
        _ => {
            return Err(Error::Data(
                "Invalid time format. Expected formats like 'HH:MM:SS', 'MM:SS', or 'SS'".into(),
            ))
        }
    };

    if total < 0.0 {
        return Err(Error::Data(format!("Negative time value: '{}'", s)));
    }

    Ok(total.round() as u32)
}

/// Format whole seconds as `HH:MM:SS`.
pub fn from_seconds(seconds: u32) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_pads_missing_components() {
        assert_eq!(normalize("42").unwrap(), "00:00:42");
        assert_eq!(normalize("01:42").unwrap(), "00:01:42");
        assert_eq!(normalize("01:02:42").unwrap(), "01:02:42");
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize("").is_err());
        assert!(normalize("1:2:3:4").is_err());
    }

    #[test]
    fn to_seconds_handles_all_formats() {
        assert_eq!(to_seconds("00:01:30").unwrap(), 90);
        assert_eq!(to_seconds("1:30").unwrap(), 90);
        assert_eq!(to_seconds("90").unwrap(), 90);
        assert_eq!(to_seconds("01:00:00").unwrap(), 3600);
    }

    #[test]
    fn to_seconds_rounds_fractions() {
        assert_eq!(to_seconds("1:29.6").unwrap(), 90);
    }

    #[test]
    fn to_seconds_rejects_bad_input() {
        assert!(to_seconds("abc").is_err());
        assert!(to_seconds("1:2:3:4").is_err());
        assert!(to_seconds("-5").is_err());
    }

    #[test]
    fn from_seconds_round_trips() {
        assert_eq!(from_seconds(90), "00:01:30");
        assert_eq!(from_seconds(3661), "01:01:01");
        assert_eq!(to_seconds(&from_seconds(7322)).unwrap(), 7322);
    }
}
