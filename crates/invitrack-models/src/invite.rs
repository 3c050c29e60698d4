use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{parse_id, PayloadError};

/// Lookup key under which a server's vanity invite is stored next to its own code.
pub const VANITY_ALIAS: &str = "VANITY";

/// One server's invites keyed by lookup code. Iteration order is code order.
pub type InviteSnapshot = BTreeMap<String, InviteRecord>;

/// Immutable snapshot of a single invite as last reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRecord {
    pub code: String,
    pub server_id: i64,
    pub channel_id: i64,
    /// `None` for invites created by integrations.
    pub inviter_id: Option<i64>,
    pub uses: u32,
    /// Lifetime in seconds. Zero never expires.
    pub max_age: u32,
    pub created_at: DateTime<Utc>,
}

impl InviteRecord {
    pub fn is_permanent(&self) -> bool {
        self.max_age == 0
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.is_permanent() {
            return None;
        }
        Some(self.created_at + Duration::seconds(i64::from(self.max_age)))
    }

    /// Time left before expiry as seen at `now`. Negative once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at().map(|at| at - now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Same platform invite, ignoring the use counter.
    pub fn same_invite(&self, other: &InviteRecord) -> bool {
        self.code == other.code
            && self.server_id == other.server_id
            && self.created_at == other.created_at
    }
}

pub fn is_vanity_alias(key: &str) -> bool {
    key == VANITY_ALIAS
}

/// Invite object as serialized by the platform REST API and gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitePayload {
    pub code: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub inviter_id: Option<String>,
    #[serde(default)]
    pub uses: i64,
    #[serde(default)]
    pub max_age: Option<i64>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl InvitePayload {
    /// Convert into a record. `server_id` is used when the payload omits `guild_id`
    /// (the REST listing is already scoped by path).
    pub fn into_record(self, server_id: i64) -> Result<InviteRecord, PayloadError> {
        let server_id = match self.guild_id.as_deref() {
            Some(raw) => parse_id("guild_id", raw)?,
            None => server_id,
        };
        let channel_id = self
            .channel_id
            .as_deref()
            .ok_or(PayloadError::MissingField("channel_id"))
            .and_then(|raw| parse_id("channel_id", raw))?;
        let inviter_id = self
            .inviter_id
            .as_deref()
            .map(|raw| parse_id("inviter_id", raw))
            .transpose()?;
        let uses = u32::try_from(self.uses).map_err(|_| PayloadError::InvalidValue {
            field: "uses",
            reason: format!("{} is out of range", self.uses),
        })?;
        let max_age = u32::try_from(self.max_age.unwrap_or(0)).map_err(|_| {
            PayloadError::InvalidValue {
                field: "max_age",
                reason: format!("{:?} is out of range", self.max_age),
            }
        })?;
        let created_at = match (self.created_at, max_age) {
            (Some(at), _) => at,
            // Permanent invites never consult their creation time.
            (None, 0) => DateTime::<Utc>::default(),
            (None, _) => return Err(PayloadError::MissingField("created_at")),
        };

        Ok(InviteRecord {
            code: self.code,
            server_id,
            channel_id,
            inviter_id,
            uses,
            max_age,
            created_at,
        })
    }
}
