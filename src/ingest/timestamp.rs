use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("invalid time format '{0}'")]
    InvalidFormat(String),

    #[error("failed to parse timestamp '{value}' with format '{format}': {source}")]
    ParseError {
        value: String,
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampFormat {
    Strptime(String),
    Iso8601,
    Epoch,
    EpochMs,
}

impl TimestampFormat {
    fn name(&self) -> &str {
        match self {
            TimestampFormat::Strptime(fmt) => fmt,
            TimestampFormat::Iso8601 => "iso8601",
            TimestampFormat::Epoch => "epoch",
            TimestampFormat::EpochMs => "epoch_ms",
        }
    }
}

/// Converts the configured time field into whole epoch seconds.
#[derive(Debug, Clone)]
pub struct TimestampParser {
    format: TimestampFormat,
}

impl TimestampParser {
    /// `format` is one of: strptime format string, 'iso8601', 'epoch', 'epoch_ms'
    pub fn new(format: &str) -> Result<Self, TimestampError> {
        let format = match format {
            "iso8601" => TimestampFormat::Iso8601,
            "epoch" => TimestampFormat::Epoch,
            "epoch_ms" => TimestampFormat::EpochMs,
            other => {
                let has_error = StrftimeItems::new(other).any(|item| matches!(item, Item::Error));
                if other.is_empty() || !other.contains('%') || has_error {
                    return Err(TimestampError::InvalidFormat(other.to_string()));
                }
                TimestampFormat::Strptime(other.to_string())
            }
        };

        Ok(Self { format })
    }

    pub fn format(&self) -> &TimestampFormat {
        &self.format
    }

    /// Parse `value` to seconds since the epoch, truncating sub-second precision.
    pub fn parse_epoch_secs(&self, value: &str) -> Result<i64, TimestampError> {
        let value = value.trim();
        match &self.format {
            TimestampFormat::Epoch => self.parse_number(value, 1.0),
            TimestampFormat::EpochMs => self.parse_number(value, 1000.0),
            TimestampFormat::Iso8601 => self.parse_iso8601(value).map(|dt| dt.timestamp()),
            TimestampFormat::Strptime(fmt) => {
                self.parse_strptime(value, fmt).map(|dt| dt.timestamp())
            }
        }
    }

    fn error(
        &self,
        value: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> TimestampError {
        TimestampError::ParseError {
            value: value.to_string(),
            format: self.format.name().to_string(),
            source: source.into(),
        }
    }

    fn parse_number(&self, value: &str, divisor: f64) -> Result<i64, TimestampError> {
        if let Ok(whole) = value.parse::<i64>() {
            return Ok(whole.div_euclid(divisor as i64));
        }

        let fractional: f64 = value
            .parse()
            .map_err(|e: std::num::ParseFloatError| self.error(value, e))?;
        let secs = (fractional / divisor).floor();
        if !secs.is_finite() || secs.abs() > i64::MAX as f64 {
            return Err(self.error(value, "timestamp out of range"));
        }
        Ok(secs as i64)
    }

    fn parse_iso8601(&self, value: &str) -> Result<DateTime<Utc>, TimestampError> {
        // Try parsing as RFC3339 (which handles ISO8601 with timezone)
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| self.error(value, e))
    }

    fn parse_strptime(&self, value: &str, format: &str) -> Result<DateTime<Utc>, TimestampError> {
        if format.contains("%z") || format.contains("%:z") {
            DateTime::parse_from_str(value, format)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| self.error(value, e))
        } else {
            // Parse as naive datetime and assume UTC
            NaiveDateTime::parse_from_str(value, format)
                .map(|ndt| Utc.from_utc_datetime(&ndt))
                .map_err(|e| self.error(value, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_seconds() {
        let parser = TimestampParser::new("epoch").unwrap();
        assert_eq!(parser.parse_epoch_secs("1733280131").unwrap(), 1733280131);
        assert_eq!(parser.parse_epoch_secs(" 42 ").unwrap(), 42);
    }

    #[test]
    fn test_epoch_fractional_truncates() {
        let parser = TimestampParser::new("epoch").unwrap();
        assert_eq!(parser.parse_epoch_secs("1400000000.75").unwrap(), 1400000000);
    }

    #[test]
    fn test_epoch_milliseconds() {
        let parser = TimestampParser::new("epoch_ms").unwrap();
        assert_eq!(parser.parse_epoch_secs("1733280131011").unwrap(), 1733280131);
    }

    #[test]
    fn test_iso8601_with_offset() {
        let parser = TimestampParser::new("iso8601").unwrap();
        let secs = parser.parse_epoch_secs("2025-12-04T02:42:11+05:30").unwrap();
        let expected = DateTime::parse_from_rfc3339("2025-12-03T21:12:11Z")
            .unwrap()
            .timestamp();
        assert_eq!(secs, expected);
    }

    #[test]
    fn test_timezone_aware_strptime() {
        let parser = TimestampParser::new("%Y-%m-%d %H:%M:%S %z").unwrap();
        let secs = parser.parse_epoch_secs("2025-12-04 02:42:11 +0530").unwrap();
        let expected = DateTime::parse_from_rfc3339("2025-12-03T21:12:11Z")
            .unwrap()
            .timestamp();
        assert_eq!(secs, expected);
    }

    #[test]
    fn test_timezone_naive_assumes_utc() {
        let parser = TimestampParser::new("%Y-%m-%d %H:%M:%S").unwrap();
        let secs = parser.parse_epoch_secs("1970-01-01 00:01:40").unwrap();
        assert_eq!(secs, 100);
    }

    #[test]
    fn test_unparseable_timestamp() {
        let parser = TimestampParser::new("epoch").unwrap();
        let result = parser.parse_epoch_secs("not_a_number");
        assert!(matches!(result, Err(TimestampError::ParseError { .. })));

        assert!(parser.parse_epoch_secs("").is_err());
    }

    #[test]
    fn test_invalid_format_rejected() {
        assert!(matches!(
            TimestampParser::new("yyyy-MM-dd"),
            Err(TimestampError::InvalidFormat(_))
        ));
        assert!(TimestampParser::new("%Y-%Q").is_err());
    }
}
