use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{parse_id, PayloadError};

/// A member who has just joined a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedMember {
    pub server_id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub bot: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberUserPayload {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

/// `GUILD_MEMBER_ADD` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberAddPayload {
    pub guild_id: String,
    pub user: MemberUserPayload,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

impl MemberAddPayload {
    /// `received_at` stands in for a missing `joined_at`.
    pub fn into_member(self, received_at: DateTime<Utc>) -> Result<JoinedMember, PayloadError> {
        Ok(JoinedMember {
            server_id: parse_id("guild_id", &self.guild_id)?,
            user_id: parse_id("user.id", &self.user.id)?,
            username: self.user.username,
            bot: self.user.bot,
            joined_at: self.joined_at.unwrap_or(received_at),
        })
    }
}
