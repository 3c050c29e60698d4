pub mod gateway;
pub mod invite;
pub mod member;

use thiserror::Error;

/// Failure to turn a platform payload into a model type.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid snowflake in {field}: {value}")]
    InvalidId { field: &'static str, value: String },
    #[error("invalid value in {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse a snowflake that the platform sends as a decimal string.
pub fn parse_id(field: &'static str, value: &str) -> Result<i64, PayloadError> {
    value.parse::<i64>().map_err(|_| PayloadError::InvalidId {
        field,
        value: value.to_string(),
    })
}
