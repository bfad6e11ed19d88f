//! Column decoding for the TEXT-heavy task schema.
//!
//! Uuids, timestamps, and JSON blobs are stored as text; every decoder
//! names the offending column so a corrupt row is diagnosable from the
//! error alone.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

fn bad(column: &str, detail: impl std::fmt::Display) -> DomainError {
    DomainError::Serialization(format!("column {column}: {detail}"))
}

pub fn uuid(column: &str, raw: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| bad(column, e))
}

pub fn uuid_opt(column: &str, raw: Option<String>) -> DomainResult<Option<Uuid>> {
    raw.map(|s| uuid(column, &s)).transpose()
}

pub fn datetime(column: &str, raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| bad(column, e))
}

pub fn datetime_opt(column: &str, raw: Option<String>) -> DomainResult<Option<DateTime<Utc>>> {
    raw.map(|s| datetime(column, &s)).transpose()
}

/// Decode a JSON column; NULL falls back to the type's default so added
/// columns don't invalidate old rows.
pub fn json<T>(column: &str, raw: Option<String>) -> DomainResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match raw {
        Some(s) => serde_json::from_str(&s).map_err(|e| bad(column, e)),
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_column() {
        let err = uuid("tasks.id", "not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("tasks.id"));

        let err = datetime("tasks.created_at", "yesterday").unwrap_err();
        assert!(err.to_string().contains("tasks.created_at"));

        let err = json::<Vec<String>>("tasks.metadata", Some("{broken".to_string())).unwrap_err();
        assert!(err.to_string().contains("tasks.metadata"));
    }

    #[test]
    fn null_json_defaults() {
        let decoded: Vec<String> = json("tasks.acceptance_criteria", None).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn optional_decoders_pass_none_through() {
        assert_eq!(uuid_opt("c", None).unwrap(), None);
        assert_eq!(datetime_opt("c", None).unwrap(), None);
    }
}
