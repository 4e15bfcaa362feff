use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::{QueryBuilder, Sqlite};
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{DomainError, DomainResult, ValidationError};

pub mod expense;
pub mod inventory;
pub mod project;
pub mod task;
pub mod time_entry;

pub use expense::SqliteExpenseAdapter;
pub use inventory::SqliteInventoryAdapter;
pub use project::SqliteProjectAdapter;
pub use task::SqliteTaskAdapter;
pub use time_entry::SqliteTimeEntryAdapter;

/// Extract an optional text field from a mutation payload.
///
/// Outer `None` = field absent (leave column untouched on update);
/// inner `None` = explicit JSON null (clear the column).
pub(crate) fn field_str(data: &JsonValue, key: &str) -> DomainResult<Option<Option<String>>> {
    match data.get(key) {
        None => Ok(None),
        Some(JsonValue::Null) => Ok(Some(None)),
        Some(JsonValue::String(s)) => Ok(Some(Some(s.clone()))),
        Some(_) => Err(DomainError::Validation(ValidationError::invalid_value(
            key,
            "expected a string",
        ))),
    }
}

pub(crate) fn field_i64(data: &JsonValue, key: &str) -> DomainResult<Option<Option<i64>>> {
    match data.get(key) {
        None => Ok(None),
        Some(JsonValue::Null) => Ok(Some(None)),
        Some(JsonValue::Number(n)) => n.as_i64().map(|v| Some(Some(v))).ok_or_else(|| {
            DomainError::Validation(ValidationError::invalid_value(key, "expected an integer"))
        }),
        Some(_) => Err(DomainError::Validation(ValidationError::invalid_value(
            key,
            "expected an integer",
        ))),
    }
}

pub(crate) fn field_bool(data: &JsonValue, key: &str) -> DomainResult<Option<bool>> {
    match data.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(DomainError::Validation(ValidationError::invalid_value(
            key,
            "expected a boolean",
        ))),
    }
}

/// Uuid-valued field, canonicalized so storage never holds a malformed id
pub(crate) fn field_uuid(data: &JsonValue, key: &str) -> DomainResult<Option<Option<String>>> {
    match field_str(data, key)? {
        None => Ok(None),
        Some(None) => Ok(Some(None)),
        Some(Some(s)) => {
            let id = Uuid::parse_str(&s).map_err(|_| {
                DomainError::Validation(ValidationError::format(key, "invalid UUID"))
            })?;
            Ok(Some(Some(id.to_string())))
        }
    }
}

pub(crate) fn field_decimal(data: &JsonValue, key: &str) -> DomainResult<Option<Decimal>> {
    match data.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Decimal::from_str(s).map(Some).map_err(|_| {
            DomainError::Validation(ValidationError::invalid_value(key, "invalid decimal"))
        }),
        Some(JsonValue::Number(n)) => Decimal::from_str(&n.to_string()).map(Some).map_err(|_| {
            DomainError::Validation(ValidationError::invalid_value(key, "invalid decimal"))
        }),
        Some(_) => Err(DomainError::Validation(ValidationError::invalid_value(
            key,
            "expected a decimal",
        ))),
    }
}

pub(crate) fn required_str(data: &JsonValue, key: &str) -> DomainResult<String> {
    field_str(data, key)?
        .flatten()
        .ok_or_else(|| DomainError::Validation(ValidationError::required(key)))
}

/// Append `col = ` to an UPDATE's SET list, handling separators.
/// `col` must come from a compile-time column whitelist, never from input.
pub(crate) fn push_set(qb: &mut QueryBuilder<'_, Sqlite>, any: &mut bool, col: &'static str) {
    if *any {
        qb.push(", ");
    } else {
        *any = true;
    }
    qb.push(col);
    qb.push(" = ");
}
