//! Validation helpers for DTOs.

use std::collections::HashSet;

use validator::ValidationError;

/// Validates that a free-form identifier is not blank.
pub fn validate_non_blank(value: &str, code: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new(code);
        err.message = Some("value must not be blank".into());
        return Err(err);
    }

    Ok(())
}

/// Validates that every id in the iterator is unique.
pub fn validate_distinct_ids<'a, I>(ids: I, code: &'static str) -> Result<(), ValidationError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            let mut err = ValidationError::new(code);
            err.message = Some(format!("duplicate id `{id}`").into());
            return Err(err);
        }
    }

    Ok(())
}
