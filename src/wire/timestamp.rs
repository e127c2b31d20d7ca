//! Timestamp tolerance for OCPP wire fields.
//!
//! Field chargers emit timestamps in all manner of ISO 8601 variants, and
//! occasionally garbage. A charging session must never be dropped for a
//! clock-format quirk, so parse failures fall back to "now" instead of
//! rejecting the frame. This is the single place that rule is applied.

use chrono::{DateTime, Utc};

/// Parse an RFC 3339 / ISO 8601 timestamp, substituting the current time on
/// any parse failure.
pub fn parse_or_now(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_rfc3339() {
        let ts = parse_or_now("2024-01-01T00:00:00Z");
        assert_eq!(ts.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn parses_with_offset() {
        let ts = parse_or_now("2024-01-01T03:00:00+03:00");
        assert_eq!(ts.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn falls_back_to_now_on_garbage() {
        let before = Utc::now();
        let ts = parse_or_now("not a timestamp");
        let after = Utc::now();
        assert!(ts >= before && ts <= after);
    }

    #[test]
    fn falls_back_to_now_on_empty_string() {
        let before = Utc::now();
        let ts = parse_or_now("");
        assert!(ts >= before);
    }
}
