//! Domain model and value objects.
//!
//! Every value here validates itself at construction and returns either a fully valid value or
//! the complete list of violated rules ([`ValidationErrors`]). Entities are immutable: an update
//! produces a new value with a refreshed `updated_at`, never an in-place mutation.

pub mod audit;
pub mod clinical;
pub mod consent;
pub mod document;
pub mod patient;
pub mod status;
pub mod values;

use crate::error::{RuleCode, ValidationErrors};
use chrono::{DateTime, NaiveDate, Utc};
use vault_types::{NonEmptyText, TextError};

/// Required, trimmed, bounded text.
pub(crate) fn required_text(
    field: &str,
    input: &str,
    max: usize,
) -> Result<NonEmptyText, ValidationErrors> {
    NonEmptyText::bounded(input, max).map_err(|e| match e {
        TextError::Empty => {
            ValidationErrors::single(field, RuleCode::Required, format!("{field} is required"))
        }
        TextError::TooLong { max, actual } => ValidationErrors::single(
            field,
            RuleCode::TooLong,
            format!("{field} must be at most {max} characters (got {actual})"),
        ),
    })
}

/// Optional text: blank input becomes `None`, non-blank input must respect `max`.
pub(crate) fn optional_text(
    field: &str,
    input: Option<&str>,
    max: usize,
) -> Result<Option<NonEmptyText>, ValidationErrors> {
    match input.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => required_text(field, value, max).map(Some),
    }
}

pub(crate) fn date_not_in_future(field: &str, date: NaiveDate) -> Result<NaiveDate, ValidationErrors> {
    if date > Utc::now().date_naive() {
        return Err(ValidationErrors::single(
            field,
            RuleCode::FutureDate,
            format!("{field} cannot be in the future"),
        ));
    }
    Ok(date)
}

pub(crate) fn instant_not_in_future(
    field: &str,
    at: DateTime<Utc>,
) -> Result<DateTime<Utc>, ValidationErrors> {
    // small allowance for clock skew between the caller and this process
    if at > Utc::now() + chrono::Duration::seconds(5) {
        return Err(ValidationErrors::single(
            field,
            RuleCode::FutureDate,
            format!("{field} cannot be in the future"),
        ));
    }
    Ok(at)
}

/// Parses a snake_case enum value, reporting the allowed set on failure.
pub(crate) fn parse_enum<T: Copy>(
    field: &str,
    input: &str,
    variants: &[(&str, T)],
) -> Result<T, ValidationErrors> {
    let needle = input.trim().to_ascii_lowercase();
    variants
        .iter()
        .find(|(name, _)| *name == needle)
        .map(|(_, v)| *v)
        .ok_or_else(|| {
            let allowed: Vec<&str> = variants.iter().map(|(n, _)| *n).collect();
            ValidationErrors::single(
                field,
                RuleCode::InvalidValue,
                format!("'{}' is not one of: {}", input.trim(), allowed.join(", ")),
            )
        })
}
