pub mod entity;
pub mod outbox;
pub mod sync;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{DomainError, DomainResult, ValidationError};

pub(crate) fn parse_uuid(uuid_str: &str, field_name: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(uuid_str).map_err(|_| {
        DomainError::Validation(ValidationError::format(
            field_name,
            &format!("Invalid UUID format: {}", uuid_str),
        ))
    })
}

pub(crate) fn parse_datetime(dt_str: &str, field_name: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(dt_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            DomainError::Validation(ValidationError::format(
                field_name,
                &format!("Invalid RFC3339 format: {}", dt_str),
            ))
        })
}

pub(crate) fn parse_optional_datetime(
    dt_str: Option<String>,
    field_name: &str,
) -> DomainResult<Option<DateTime<Utc>>> {
    dt_str.map(|s| parse_datetime(&s, field_name)).transpose()
}
