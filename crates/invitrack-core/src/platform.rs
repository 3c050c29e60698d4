use async_trait::async_trait;
use invitrack_models::invite::{InviteRecord, InviteSnapshot, VANITY_ALIAS};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("http error: {0}")]
    Http(String),
    #[error("missing permission to list invites")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Read access to the chat platform's invite endpoints.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn fetch_invites(&self, server_id: i64) -> Result<Vec<InviteRecord>, PlatformError>;

    /// `Ok(None)` when the server has no vanity URL.
    async fn fetch_vanity_invite(
        &self,
        server_id: i64,
    ) -> Result<Option<InviteRecord>, PlatformError>;
}

/// Fetch a server's invites keyed by code. The vanity invite, if any, appears
/// under both its own code and [`VANITY_ALIAS`].
pub async fn fetch_snapshot(
    platform: &dyn Platform,
    server_id: i64,
) -> Result<InviteSnapshot, PlatformError> {
    let invites = platform.fetch_invites(server_id).await?;
    let mut snapshot: InviteSnapshot = invites
        .into_iter()
        .filter(|invite| invite.server_id == server_id)
        .map(|invite| (invite.code.clone(), invite))
        .collect();

    match platform.fetch_vanity_invite(server_id).await {
        Ok(Some(vanity)) if vanity.server_id == server_id => {
            snapshot.insert(VANITY_ALIAS.to_string(), vanity.clone());
            snapshot.insert(vanity.code.clone(), vanity);
        }
        Ok(_) => {}
        // Usually a server without the vanity feature or without permission.
        Err(e) => tracing::debug!(server_id, error = %e, "vanity invite unavailable"),
    }

    Ok(snapshot)
}
