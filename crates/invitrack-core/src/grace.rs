use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::CommunityInviteCache;
use crate::events::{EventBus, TrackerEvent};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(300);
pub const DEFAULT_GRACE_POLL: Duration = Duration::from_secs(1);

/// Deferred cache drop for servers that disappear. A server that comes back
/// within the grace period keeps its invites; otherwise they are dropped once.
pub struct GracePeriodManager {
    cache: Arc<CommunityInviteCache>,
    events: EventBus,
    period: Duration,
    poll_interval: Duration,
    visible: DashSet<i64>,
    pending: DashMap<i64, JoinHandle<()>>,
}

impl GracePeriodManager {
    pub fn new(
        cache: Arc<CommunityInviteCache>,
        events: EventBus,
        period: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            cache,
            events,
            period,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            visible: DashSet::new(),
            pending: DashMap::new(),
        }
    }

    /// Cancel the grace window for a server, so a later outage starts a full one.
    pub fn server_visible(&self, server_id: i64) {
        self.visible.insert(server_id);
        if let Some((_, handle)) = self.pending.remove(&server_id) {
            handle.abort();
        }
    }

    pub fn is_visible(&self, server_id: i64) -> bool {
        self.visible.contains(&server_id)
    }

    /// Start the grace window for a server. A window already running for it is
    /// left alone.
    pub fn server_unavailable(self: &Arc<Self>, server_id: i64) {
        self.visible.remove(&server_id);

        if self
            .pending
            .get(&server_id)
            .is_some_and(|handle| !handle.is_finished())
        {
            tracing::debug!(server_id, "grace period already running");
            return;
        }

        tracing::info!(
            server_id,
            grace_secs = self.period.as_secs(),
            "server unavailable, invites kept for grace period"
        );
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.run_grace(server_id).await;
        });
        self.pending.insert(server_id, handle);
    }

    async fn run_grace(&self, server_id: i64) {
        let deadline = Instant::now() + self.period;
        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            if self.visible.contains(&server_id) {
                tracing::debug!(server_id, "server back within grace period");
                return;
            }
        }

        if self.cache.drop_server(server_id) {
            tracing::info!(server_id, "grace period elapsed, server invites dropped");
            self.events.publish(TrackerEvent::ServerDropped { server_id });
        }
    }

    /// Grace windows still counting down.
    pub fn pending(&self) -> usize {
        self.pending
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    pub fn shutdown(&self) {
        for entry in self.pending.iter() {
            entry.value().abort();
        }
        self.pending.clear();
    }
}
