//! Minimum-expiry scheduling.
//!
//! Two tasks cooperate. The recompute loop rebuilds an [`ExpiryIndex`] from the
//! cache on a fixed period (and on request). The expiry loop sleeps until the
//! soonest indexed invite expires, removes it, and picks the next one. When a
//! recompute finds an invite that expires before the expiry loop would wake,
//! it aborts that task and spawns a fresh one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use invitrack_models::invite::InviteRecord;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::cache::CommunityInviteCache;
use crate::clock::Clock;
use crate::events::{EventBus, TrackerEvent};

/// Position of an invite in the index: time left as measured at the last
/// recompute, then server and code to keep keys unique.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexKey {
    pub remaining_ms: i64,
    pub server_id: i64,
    pub code: String,
}

/// Derived, rebuildable ordering of expiring invites. Never authoritative.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    entries: BTreeMap<IndexKey, InviteRecord>,
}

impl ExpiryIndex {
    /// Index every expiring record by its remaining time at `now`. Permanent
    /// invites are left out.
    pub fn build(records: impl IntoIterator<Item = InviteRecord>, now: DateTime<Utc>) -> Self {
        let entries = records
            .into_iter()
            .filter_map(|record| {
                let remaining = record.remaining(now)?;
                let key = IndexKey {
                    remaining_ms: remaining.num_milliseconds(),
                    server_id: record.server_id,
                    code: record.code.clone(),
                };
                Some((key, record))
            })
            .collect();
        Self { entries }
    }

    pub fn first(&self) -> Option<(&IndexKey, &InviteRecord)> {
        self.entries.iter().next()
    }

    pub fn min_remaining_ms(&self) -> Option<i64> {
        self.entries.keys().next().map(|key| key.remaining_ms)
    }

    /// Drop every entry for one invite, whichever recompute measured it.
    pub fn remove_invite(&mut self, server_id: i64, code: &str) {
        self.entries
            .retain(|key, _| !(key.server_id == server_id && key.code == code));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The invite the running expiry loop is sleeping on.
#[derive(Debug, Clone)]
struct Target {
    key: IndexKey,
    /// The recompute `key.remaining_ms` was measured at.
    measured_at: DateTime<Utc>,
}

impl Target {
    fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        self.key.remaining_ms - (now - self.measured_at).num_milliseconds()
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    index: ExpiryIndex,
    last_recompute: Option<DateTime<Utc>>,
    target: Option<Target>,
}

/// What a recompute did to the expiry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecomputeOutcome {
    /// Nothing expiring is cached.
    Empty,
    /// The loop had no target and was signalled to pick one.
    Woke,
    /// The loop's target still expires first.
    Kept,
    /// A sooner expiry was found; the loop was aborted and respawned.
    Restarted,
}

enum Expiry {
    Done,
    NotYet(Duration),
}

pub struct ExpiryScheduler {
    cache: Arc<CommunityInviteCache>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    recompute_interval: Duration,
    state: Mutex<SchedulerState>,
    ready: watch::Sender<bool>,
    index_filled: Notify,
    recompute_requested: Notify,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
    recompute_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExpiryScheduler {
    pub fn new(
        cache: Arc<CommunityInviteCache>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        recompute_interval: Duration,
    ) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            cache,
            events,
            clock,
            recompute_interval,
            state: Mutex::new(SchedulerState::default()),
            ready,
            index_filled: Notify::new(),
            recompute_requested: Notify::new(),
            expiry_task: Mutex::new(None),
            recompute_task: Mutex::new(None),
        }
    }

    /// Spawn both loops. The first recompute runs immediately. Calling this
    /// while the loops are running does nothing.
    pub fn start(self: &Arc<Self>) {
        {
            let mut slot = lock(&self.recompute_task);
            if slot.as_ref().is_some_and(|task| !task.is_finished()) {
                return;
            }
            let this = Arc::clone(self);
            *slot = Some(tokio::spawn(async move {
                this.run_recompute_loop().await;
            }));
        }
        self.respawn_expiry_loop();
        tracing::info!(
            interval_secs = self.recompute_interval.as_secs(),
            "expiry scheduler started"
        );
    }

    pub fn stop(&self) {
        for slot in [&self.recompute_task, &self.expiry_task] {
            if let Some(handle) = lock(slot).take() {
                handle.abort();
            }
        }
    }

    /// Ask the recompute loop to run now instead of at its next tick. Never blocks.
    pub fn request_recompute(&self) {
        self.recompute_requested.notify_one();
    }

    /// Resolves once the first recompute has finished.
    pub async fn wait_for_index_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this only returns once ready.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_index_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn indexed(&self) -> usize {
        lock(&self.state).index.len()
    }

    async fn run_recompute_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.recompute_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.recompute_requested.notified() => {}
            }
            self.recompute();
        }
    }

    /// Rebuild the index from the cache and decide whether the expiry loop must
    /// start over.
    pub fn recompute(self: &Arc<Self>) -> RecomputeOutcome {
        let now = self.clock.now();
        let index = ExpiryIndex::build(self.cache.flatten(), now);
        let new_min = index.min_remaining_ms();
        let indexed = index.len();

        let outcome = {
            let mut state = lock(&self.state);
            let in_flight = state.target.as_ref().map(|target| target.remaining_ms(now));
            state.index = index;
            state.last_recompute = Some(now);

            match (new_min, in_flight) {
                (None, _) => RecomputeOutcome::Empty,
                (Some(_), None) => RecomputeOutcome::Woke,
                (Some(min), Some(remaining)) if min < remaining => {
                    state.target = None;
                    RecomputeOutcome::Restarted
                }
                (Some(_), Some(_)) => RecomputeOutcome::Kept,
            }
        };

        if !*self.ready.borrow() {
            self.ready.send_replace(true);
            tracing::info!(indexed, "expiry index ready");
        }

        match outcome {
            RecomputeOutcome::Woke => self.index_filled.notify_one(),
            RecomputeOutcome::Restarted => {
                tracing::debug!(min_remaining_ms = ?new_min, "sooner expiry found, restarting expiry loop");
                self.respawn_expiry_loop();
            }
            RecomputeOutcome::Empty | RecomputeOutcome::Kept => {}
        }

        let crashed = lock(&self.expiry_task)
            .as_ref()
            .is_some_and(|handle| handle.is_finished());
        if crashed {
            tracing::error!("expiry loop exited unexpectedly, respawning");
            lock(&self.state).target = None;
            self.respawn_expiry_loop();
        }

        tracing::debug!(indexed, ?outcome, "expiry index recomputed");
        outcome
    }

    fn respawn_expiry_loop(self: &Arc<Self>) {
        let mut slot = lock(&self.expiry_task);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            this.run_expiry_loop().await;
        }));
    }

    async fn run_expiry_loop(self: Arc<Self>) {
        loop {
            let Some((record, wait)) = self.pick_next() else {
                self.index_filled.notified().await;
                continue;
            };

            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }

            loop {
                match self.try_expire(&record) {
                    Expiry::Done => break,
                    Expiry::NotYet(residual) => tokio::time::sleep(residual).await,
                }
            }
        }
    }

    /// Take the soonest entry and record it as the current target.
    fn pick_next(&self) -> Option<(InviteRecord, Duration)> {
        let now = self.clock.now();
        let mut state = lock(&self.state);
        let measured_at = state.last_recompute?;
        let (key, record) = state
            .index
            .first()
            .map(|(key, record)| (key.clone(), record.clone()))?;

        let target = Target { key, measured_at };
        let wait_ms = target.remaining_ms(now).max(0);
        state.target = Some(target);

        Some((record, Duration::from_millis(wait_ms as u64)))
    }

    /// Remove an invite whose time is up. Synchronous, so an abort can never
    /// land halfway through.
    fn try_expire(&self, record: &InviteRecord) -> Expiry {
        let now = self.clock.now();
        if let Some(remaining) = record.remaining(now) {
            if remaining > chrono::Duration::zero() {
                // Woke before the wall clock agrees; finish the wait.
                let residual = remaining.to_std().unwrap_or_default() + Duration::from_millis(1);
                return Expiry::NotYet(residual);
            }
        }

        {
            let mut state = lock(&self.state);
            state.index.remove_invite(record.server_id, &record.code);
            state.target = None;
        }

        if self.cache.remove_if_same(record) {
            tracing::info!(
                server_id = record.server_id,
                code = %record.code,
                max_age = record.max_age,
                "invite expired"
            );
            self.events.publish(TrackerEvent::InviteExpired {
                invite: record.clone(),
            });
        } else {
            tracing::debug!(
                server_id = record.server_id,
                code = %record.code,
                "expired invite already gone from cache"
            );
        }
        Expiry::Done
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
