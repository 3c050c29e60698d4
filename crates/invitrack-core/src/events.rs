use invitrack_models::invite::InviteRecord;
use invitrack_models::member::JoinedMember;
use serde::Serialize;
use tokio::sync::broadcast;

pub const EVENT_INVITE_UPDATE: &str = "invite_update";
pub const EVENT_INVITE_EXPIRED: &str = "invite_expired";
pub const EVENT_INVITE_REMOVED: &str = "invite_removed";
pub const EVENT_SERVER_DROPPED: &str = "server_dropped";

/// Why an invite left the cache other than by expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Deleted,
    ChannelDeleted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    /// A member joined. `invite` is `None` when no use count moved; `ambiguous`
    /// lists every candidate when more than one did.
    InviteUpdate {
        member: JoinedMember,
        invite: Option<InviteRecord>,
        ambiguous: Vec<InviteRecord>,
    },
    InviteExpired {
        invite: InviteRecord,
    },
    InviteRemoved {
        invite: InviteRecord,
        reason: RemovalReason,
    },
    ServerDropped {
        server_id: i64,
    },
}

impl TrackerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TrackerEvent::InviteUpdate { .. } => EVENT_INVITE_UPDATE,
            TrackerEvent::InviteExpired { .. } => EVENT_INVITE_EXPIRED,
            TrackerEvent::InviteRemoved { .. } => EVENT_INVITE_REMOVED,
            TrackerEvent::ServerDropped { .. } => EVENT_SERVER_DROPPED,
        }
    }

    pub fn server_id(&self) -> i64 {
        match self {
            TrackerEvent::InviteUpdate { member, .. } => member.server_id,
            TrackerEvent::InviteExpired { invite } => invite.server_id,
            TrackerEvent::InviteRemoved { invite, .. } => invite.server_id,
            TrackerEvent::ServerDropped { server_id } => *server_id,
        }
    }
}

/// Broadcast-based event bus. Delivery is at-most-once: publishing never waits,
/// events with no subscriber are dropped, and a subscriber that falls more than
/// `capacity` events behind loses the oldest ones.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TrackerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: TrackerEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
