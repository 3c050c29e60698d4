use thiserror::Error;

use crate::platform::PlatformError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invite fetch failed: {0}")]
    Fetch(#[from] PlatformError),
    #[error("invalid invite: {0}")]
    InvalidInvite(String),
}
