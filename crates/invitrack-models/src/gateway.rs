use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::invite::{InvitePayload, InviteRecord};
use crate::member::{JoinedMember, MemberAddPayload};
use crate::{parse_id, PayloadError};

// Client -> Server opcodes
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;

// Server -> Client opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_RECONNECT: u8 = 7;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

// Gateway intents
pub const INTENT_GUILDS: u64 = 1 << 0;
pub const INTENT_GUILD_MEMBERS: u64 = 1 << 1;
pub const INTENT_GUILD_INVITES: u64 = 1 << 6;

/// Everything the invite tracker subscribes to: server lifecycle and channel
/// deletes, member joins, invite create/delete.
pub const DEFAULT_INTENTS: u64 = INTENT_GUILDS | INTENT_GUILD_MEMBERS | INTENT_GUILD_INVITES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    pub fn identify(token: &str, intents: u64) -> Self {
        Self {
            op: OP_IDENTIFY,
            d: Some(json!({
                "token": token,
                "intents": intents,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "invitrack",
                    "device": "invitrack",
                },
            })),
            s: None,
            t: None,
        }
    }

    pub fn heartbeat(last_sequence: Option<u64>) -> Self {
        Self {
            op: OP_HEARTBEAT,
            d: Some(json!(last_sequence)),
            s: None,
            t: None,
        }
    }

    /// Heartbeat interval from a HELLO frame.
    pub fn heartbeat_interval_ms(&self) -> Option<u64> {
        if self.op != OP_HELLO {
            return None;
        }
        self.d.as_ref()?.get("heartbeat_interval")?.as_u64()
    }
}

// Dispatch event names
pub const EVENT_READY: &str = "READY";

// Guild events
pub const EVENT_GUILD_CREATE: &str = "GUILD_CREATE";
pub const EVENT_GUILD_DELETE: &str = "GUILD_DELETE";
pub const EVENT_GUILD_MEMBER_ADD: &str = "GUILD_MEMBER_ADD";

// Channel events
pub const EVENT_CHANNEL_DELETE: &str = "CHANNEL_DELETE";

// Invite events
pub const EVENT_INVITE_CREATE: &str = "INVITE_CREATE";
pub const EVENT_INVITE_DELETE: &str = "INVITE_DELETE";

/// The dispatches the invite tracker cares about, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Ready { server_ids: Vec<i64> },
    GuildCreate { server_id: i64 },
    /// `unavailable` is true for outages, false when the bot was removed.
    GuildDelete { server_id: i64, unavailable: bool },
    InviteCreate(InviteRecord),
    InviteDelete { server_id: i64, code: String },
    ChannelDelete { server_id: i64, channel_id: i64 },
    MemberAdd(JoinedMember),
    Ignored,
}

#[derive(Deserialize)]
struct GuildRef {
    id: String,
    #[serde(default)]
    unavailable: Option<bool>,
}

#[derive(Deserialize)]
struct ReadyPayload {
    #[serde(default)]
    guilds: Vec<GuildRef>,
}

#[derive(Deserialize)]
struct InviteDeletePayload {
    code: String,
    guild_id: Option<String>,
}

#[derive(Deserialize)]
struct ChannelDeletePayload {
    id: String,
    #[serde(default)]
    guild_id: Option<String>,
}

/// Decode one dispatch frame. Unknown event names decode to [`Dispatch::Ignored`].
pub fn parse_dispatch(
    event_type: &str,
    payload: Value,
    received_at: DateTime<Utc>,
) -> Result<Dispatch, PayloadError> {
    let dispatch = match event_type {
        EVENT_READY => {
            let ready: ReadyPayload = serde_json::from_value(payload)?;
            let server_ids = ready
                .guilds
                .iter()
                .map(|g| parse_id("guilds[].id", &g.id))
                .collect::<Result<Vec<_>, _>>()?;
            Dispatch::Ready { server_ids }
        }
        EVENT_GUILD_CREATE => {
            let guild: GuildRef = serde_json::from_value(payload)?;
            Dispatch::GuildCreate {
                server_id: parse_id("id", &guild.id)?,
            }
        }
        EVENT_GUILD_DELETE => {
            let guild: GuildRef = serde_json::from_value(payload)?;
            Dispatch::GuildDelete {
                server_id: parse_id("id", &guild.id)?,
                unavailable: guild.unavailable.unwrap_or(false),
            }
        }
        EVENT_INVITE_CREATE => {
            let invite: InvitePayload = serde_json::from_value(payload)?;
            let server_id = invite
                .guild_id
                .as_deref()
                .ok_or(PayloadError::MissingField("guild_id"))
                .and_then(|raw| parse_id("guild_id", raw))?;
            Dispatch::InviteCreate(invite.into_record(server_id)?)
        }
        EVENT_INVITE_DELETE => {
            let deleted: InviteDeletePayload = serde_json::from_value(payload)?;
            match deleted.guild_id {
                Some(raw) => Dispatch::InviteDelete {
                    server_id: parse_id("guild_id", &raw)?,
                    code: deleted.code,
                },
                // Group DM invites are not tracked.
                None => Dispatch::Ignored,
            }
        }
        EVENT_CHANNEL_DELETE => {
            let channel: ChannelDeletePayload = serde_json::from_value(payload)?;
            match channel.guild_id {
                Some(raw) => Dispatch::ChannelDelete {
                    server_id: parse_id("guild_id", &raw)?,
                    channel_id: parse_id("id", &channel.id)?,
                },
                None => Dispatch::Ignored,
            }
        }
        EVENT_GUILD_MEMBER_ADD => {
            let member: MemberAddPayload = serde_json::from_value(payload)?;
            Dispatch::MemberAdd(member.into_member(received_at)?)
        }
        _ => Dispatch::Ignored,
    };
    Ok(dispatch)
}
