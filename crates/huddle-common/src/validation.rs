//! Input validation for join requests.

use validator::{Validate, ValidationError};

use crate::error::RelayError;

pub const MAX_ROOM_ID_LEN: u64 = 64;
pub const MAX_DISPLAY_NAME_LEN: u64 = 32;

/// The user-supplied parts of a `join`.
#[derive(Debug, Validate)]
pub struct JoinRequest<'a> {
    #[validate(
        length(min = 1, max = 64, message = "Room id must be 1-64 characters"),
        custom(function = "not_blank", message = "Room id cannot be blank")
    )]
    pub room_id: &'a str,

    #[validate(
        length(min = 1, max = 32, message = "Display name must be 1-32 characters"),
        custom(function = "not_blank", message = "Display name cannot be blank")
    )]
    pub display_name: &'a str,
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// Validate a request, returning `RelayError::Validation` on failure.
pub fn validate_request<T: Validate>(body: &T) -> Result<(), RelayError> {
    body.validate().map_err(|e| RelayError::Validation {
        message: format_validation_errors(e),
    })
}

/// Format validation errors into a human-readable string.
fn format_validation_errors(errors: validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("Invalid value for '{field}'"))
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}
