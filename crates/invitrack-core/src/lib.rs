pub mod attribution;
pub mod cache;
pub mod clock;
pub mod error;
pub mod events;
pub mod expiry;
pub mod grace;
pub mod platform;

use std::sync::Arc;
use std::time::Duration;

use invitrack_models::invite::InviteRecord;
use invitrack_models::member::JoinedMember;
use invitrack_util::validation::validate_invite_code;
use tokio::sync::broadcast;

use crate::attribution::JoinAttributor;
use crate::cache::CommunityInviteCache;
use crate::clock::{Clock, SystemClock};
use crate::error::CoreError;
use crate::events::{EventBus, RemovalReason, TrackerEvent};
use crate::expiry::ExpiryScheduler;
use crate::grace::{GracePeriodManager, DEFAULT_GRACE_PERIOD, DEFAULT_GRACE_POLL};
use crate::platform::Platform;

/// Default period of the expiry index rebuild.
pub const DEFAULT_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(25 * 60);
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something the platform told us happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    InviteCreated(InviteRecord),
    InviteDeleted { server_id: i64, code: String },
    ChannelDeleted { server_id: i64, channel_id: i64 },
    /// The bot was added to a server it had not seen.
    ServerJoined(i64),
    /// A known server came back from an outage.
    ServerAvailable(i64),
    ServerUnavailable(i64),
    /// The bot was removed from a server.
    ServerRemoved(i64),
    MemberJoined(JoinedMember),
}

impl Notification {
    pub fn server_id(&self) -> i64 {
        match self {
            Notification::InviteCreated(invite) => invite.server_id,
            Notification::InviteDeleted { server_id, .. }
            | Notification::ChannelDeleted { server_id, .. } => *server_id,
            Notification::ServerJoined(id)
            | Notification::ServerAvailable(id)
            | Notification::ServerUnavailable(id)
            | Notification::ServerRemoved(id) => *id,
            Notification::MemberJoined(member) => member.server_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub recompute_interval: Duration,
    pub grace_period: Duration,
    pub grace_poll_interval: Duration,
    pub event_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            recompute_interval: DEFAULT_RECOMPUTE_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            grace_poll_interval: DEFAULT_GRACE_POLL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// The invite cache with its attributor, expiry scheduler and grace periods.
///
/// Notifications for one server must be passed to [`InviteTracker::handle`]
/// in the order the platform sent them.
pub struct InviteTracker {
    cache: Arc<CommunityInviteCache>,
    events: EventBus,
    platform: Arc<dyn Platform>,
    attributor: JoinAttributor,
    scheduler: Arc<ExpiryScheduler>,
    grace: Arc<GracePeriodManager>,
}

impl InviteTracker {
    pub fn new(platform: Arc<dyn Platform>, config: TrackerConfig) -> Self {
        Self::with_clock(platform, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        platform: Arc<dyn Platform>,
        config: TrackerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(CommunityInviteCache::new());
        let events = EventBus::new(config.event_capacity);
        let attributor = JoinAttributor::new(cache.clone(), platform.clone(), events.clone());
        let scheduler = Arc::new(ExpiryScheduler::new(
            cache.clone(),
            events.clone(),
            clock,
            config.recompute_interval,
        ));
        let grace = Arc::new(GracePeriodManager::new(
            cache.clone(),
            events.clone(),
            config.grace_period,
            config.grace_poll_interval,
        ));
        Self {
            cache,
            events,
            platform,
            attributor,
            scheduler,
            grace,
        }
    }

    /// Load every server the bot is in. Failures are logged and skipped; the
    /// server is loaded later when it becomes available again. Returns the
    /// number of servers loaded.
    pub async fn bootstrap(&self, server_ids: &[i64]) -> usize {
        let mut loaded = 0;
        for &server_id in server_ids {
            self.grace.server_visible(server_id);
            match self.cache.load(self.platform.as_ref(), server_id).await {
                Ok(_) => loaded += 1,
                Err(failure) => {
                    tracing::warn!(server_id, error = %failure.source, "bootstrap load failed")
                }
            }
        }
        tracing::info!(
            servers = server_ids.len(),
            loaded,
            invites = self.cache.len(),
            "invite cache bootstrapped"
        );
        self.scheduler.request_recompute();
        loaded
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.grace.shutdown();
        tracing::info!("invite tracker stopped");
    }

    pub async fn handle(&self, notification: Notification) -> Result<(), CoreError> {
        match notification {
            Notification::InviteCreated(invite) => {
                check_code(&invite.code)?;
                let server_id = invite.server_id;
                let expiring = !invite.is_permanent();
                if !self.cache.upsert(invite) {
                    tracing::debug!(server_id, "invite for unloaded server ignored");
                    return Ok(());
                }
                if expiring {
                    self.scheduler.request_recompute();
                }
            }
            Notification::InviteDeleted { server_id, code } => {
                check_code(&code)?;
                if let Some(invite) = self.cache.remove(server_id, &code) {
                    tracing::debug!(server_id, code = %invite.code, "invite deleted");
                    self.events.publish(TrackerEvent::InviteRemoved {
                        invite,
                        reason: RemovalReason::Deleted,
                    });
                }
            }
            Notification::ChannelDeleted {
                server_id,
                channel_id,
            } => {
                let removed = self.cache.remove_by_channel(server_id, channel_id);
                if !removed.is_empty() {
                    tracing::debug!(
                        server_id,
                        channel_id,
                        removed = removed.len(),
                        "channel deleted, invites removed"
                    );
                }
                for invite in removed {
                    self.events.publish(TrackerEvent::InviteRemoved {
                        invite,
                        reason: RemovalReason::ChannelDeleted,
                    });
                }
            }
            Notification::ServerJoined(server_id) | Notification::ServerAvailable(server_id) => {
                self.grace.server_visible(server_id);
                self.cache
                    .load(self.platform.as_ref(), server_id)
                    .await
                    .map_err(|failure| CoreError::Fetch(failure.source))?;
                self.scheduler.request_recompute();
            }
            Notification::ServerUnavailable(server_id) | Notification::ServerRemoved(server_id) => {
                self.grace.server_unavailable(server_id);
            }
            Notification::MemberJoined(member) => {
                let (cached, attribution) = self.attributor.on_member_join(member).await;
                if attribution.discovered_expiring(&cached).next().is_some() {
                    self.scheduler.request_recompute();
                }
            }
        }
        Ok(())
    }

    pub fn get_invite_by_code(&self, code: &str) -> Option<InviteRecord> {
        self.cache.get(code)
    }

    pub async fn wait_for_index_ready(&self) {
        self.scheduler.wait_for_index_ready().await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &Arc<CommunityInviteCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<ExpiryScheduler> {
        &self.scheduler
    }

    pub fn grace(&self) -> &Arc<GracePeriodManager> {
        &self.grace
    }
}

fn check_code(code: &str) -> Result<(), CoreError> {
    validate_invite_code(code).map_err(|e| CoreError::InvalidInvite(format!("{code:?}: {e}")))
}
