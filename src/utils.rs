use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::errors::{DomainError, DomainResult, ValidationError};

/// Format a timestamp for storage.
///
/// Always micros + Z so stored values are fixed-width and lexicographic
/// ordering matches chronological ordering in SQL comparisons.
pub(crate) fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(dt_str: &str, field_name: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            DomainError::Validation(ValidationError::format(
                field_name,
                &format!("Invalid RFC3339 format: {}", dt_str),
            ))
        })
}

pub(crate) fn parse_opt_ts(
    dt_str: Option<String>,
    field_name: &str,
) -> DomainResult<Option<DateTime<Utc>>> {
    dt_str.map(|s| parse_ts(&s, field_name)).transpose()
}

pub(crate) fn parse_uuid(uuid_str: &str, field_name: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(uuid_str).map_err(|_| {
        DomainError::Validation(ValidationError::format(
            field_name,
            &format!("Invalid UUID format: {}", uuid_str),
        ))
    })
}

pub(crate) fn parse_opt_uuid(
    uuid_str: Option<String>,
    field_name: &str,
) -> DomainResult<Option<Uuid>> {
    uuid_str.map(|s| parse_uuid(&s, field_name)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(5);
        let (fa, fb) = (format_ts(&a), format_ts(&b));
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
    }

    #[test]
    fn test_roundtrip() {
        let now = Utc::now();
        let parsed = parse_ts(&format_ts(&now), "ts").unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(parse_uuid("not-a-uuid", "id").is_err());
    }
}
