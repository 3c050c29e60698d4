use thiserror::Error;

/// Reserved lookup alias; never a real platform code.
const RESERVED_CODE: &str = "VANITY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("value is too short (min {min}, got {got})")]
    TooShort { min: usize, got: usize },
    #[error("value is too long (max {max}, got {got})")]
    TooLong { max: usize, got: usize },
    #[error("invalid characters")]
    InvalidCharacters,
    #[error("reserved value: {0}")]
    Reserved(&'static str),
}

/// Invite codes are 2-32 ASCII alphanumerics or dashes. Vanity codes share the
/// same alphabet.
pub fn validate_invite_code(code: &str) -> Result<(), ValidationError> {
    let len = code.len();
    if len < 2 {
        return Err(ValidationError::TooShort { min: 2, got: len });
    }
    if len > 32 {
        return Err(ValidationError::TooLong { max: 32, got: len });
    }
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ValidationError::InvalidCharacters);
    }
    if code == RESERVED_CODE {
        return Err(ValidationError::Reserved(RESERVED_CODE));
    }
    Ok(())
}
