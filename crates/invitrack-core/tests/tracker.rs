use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use invitrack_core::clock::{Clock, TokioClock};
use invitrack_core::error::CoreError;
use invitrack_core::events::{RemovalReason, TrackerEvent};
use invitrack_core::platform::{Platform, PlatformError};
use invitrack_core::{InviteTracker, Notification, TrackerConfig};
use invitrack_models::invite::InviteRecord;
use invitrack_models::member::JoinedMember;
use tokio::sync::broadcast::error::TryRecvError;

#[derive(Default)]
struct MemoryPlatform {
    invites: Mutex<HashMap<i64, Vec<InviteRecord>>>,
    failing: Mutex<HashSet<i64>>,
}

impl MemoryPlatform {
    fn set(&self, server_id: i64, invites: Vec<InviteRecord>) {
        self.invites.lock().unwrap().insert(server_id, invites);
    }

    fn fail(&self, server_id: i64) {
        self.failing.lock().unwrap().insert(server_id);
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn fetch_invites(&self, server_id: i64) -> Result<Vec<InviteRecord>, PlatformError> {
        if self.failing.lock().unwrap().contains(&server_id) {
            return Err(PlatformError::Http("connection reset".into()));
        }
        Ok(self
            .invites
            .lock()
            .unwrap()
            .get(&server_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_vanity_invite(
        &self,
        _server_id: i64,
    ) -> Result<Option<InviteRecord>, PlatformError> {
        Ok(None)
    }
}

fn record(
    server_id: i64,
    code: &str,
    uses: u32,
    max_age: u32,
    created_at: DateTime<Utc>,
) -> InviteRecord {
    InviteRecord {
        code: code.to_string(),
        server_id,
        channel_id: 10,
        inviter_id: Some(42),
        uses,
        max_age,
        created_at,
    }
}

fn member(server_id: i64, user_id: i64) -> JoinedMember {
    JoinedMember {
        server_id,
        user_id,
        username: Some(format!("user{user_id}")),
        bot: false,
        joined_at: Utc::now(),
    }
}

struct Setup {
    tracker: InviteTracker,
    platform: Arc<MemoryPlatform>,
    clock: Arc<TokioClock>,
}

fn setup() -> Setup {
    let platform = Arc::new(MemoryPlatform::default());
    let clock = Arc::new(TokioClock::new());
    let tracker =
        InviteTracker::with_clock(platform.clone(), TrackerConfig::default(), clock.clone());
    Setup {
        tracker,
        platform,
        clock,
    }
}

#[tokio::test(start_paused = true)]
async fn bootstrap_then_lookup_by_code() {
    let Setup {
        tracker, platform, ..
    } = setup();
    platform.set(1, vec![record(1, "alpha", 0, 0, Utc::now())]);
    platform.set(2, vec![record(2, "beta", 3, 0, Utc::now())]);
    platform.fail(3);

    assert_eq!(tracker.bootstrap(&[1, 2, 3]).await, 2);
    tracker.start();
    tracker.wait_for_index_ready().await;

    assert_eq!(tracker.get_invite_by_code("beta").map(|i| i.server_id), Some(2));
    assert!(tracker.get_invite_by_code("gamma").is_none());
    assert!(!tracker.cache().is_loaded(3));
    tracker.shutdown();
}

#[tokio::test(start_paused = true)]
async fn member_join_reports_the_invite_whose_uses_moved() {
    let Setup {
        tracker, platform, ..
    } = setup();
    let now = Utc::now();
    platform.set(1, vec![record(1, "aaa", 1, 0, now), record(1, "bbb", 2, 0, now)]);
    tracker.bootstrap(&[1]).await;
    let mut rx = tracker.subscribe();

    platform.set(1, vec![record(1, "aaa", 1, 0, now), record(1, "bbb", 3, 0, now)]);
    tracker.handle(Notification::MemberJoined(member(1, 500))).await.unwrap();

    match rx.try_recv().unwrap() {
        TrackerEvent::InviteUpdate {
            member,
            invite,
            ambiguous,
        } => {
            assert_eq!(member.user_id, 500);
            assert_eq!(invite.map(|i| i.code), Some("bbb".to_string()));
            assert!(ambiguous.is_empty());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(tracker.get_invite_by_code("bbb").map(|i| i.uses), Some(3));
}

#[tokio::test(start_paused = true)]
async fn two_moved_counts_pick_first_code_and_flag_ambiguity() {
    let Setup {
        tracker, platform, ..
    } = setup();
    let now = Utc::now();
    platform.set(1, vec![record(1, "zed", 0, 0, now), record(1, "abc", 0, 0, now)]);
    tracker.bootstrap(&[1]).await;
    let mut rx = tracker.subscribe();

    platform.set(1, vec![record(1, "zed", 1, 0, now), record(1, "abc", 1, 0, now)]);
    tracker.handle(Notification::MemberJoined(member(1, 501))).await.unwrap();

    let TrackerEvent::InviteUpdate {
        invite, ambiguous, ..
    } = rx.try_recv().unwrap()
    else {
        panic!("expected invite_update");
    };
    assert_eq!(invite.map(|i| i.code), Some("abc".to_string()));
    let codes: Vec<_> = ambiguous.into_iter().map(|i| i.code).collect();
    assert_eq!(codes, vec!["abc", "zed"]);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_on_join_reports_unknown_and_keeps_cache() {
    let Setup {
        tracker, platform, ..
    } = setup();
    platform.set(1, vec![record(1, "aaa", 4, 0, Utc::now())]);
    tracker.bootstrap(&[1]).await;
    let mut rx = tracker.subscribe();

    platform.fail(1);
    tracker.handle(Notification::MemberJoined(member(1, 502))).await.unwrap();

    let TrackerEvent::InviteUpdate { invite, .. } = rx.try_recv().unwrap() else {
        panic!("expected invite_update");
    };
    assert!(invite.is_none());
    assert_eq!(tracker.get_invite_by_code("aaa").map(|i| i.uses), Some(4));
}

#[tokio::test(start_paused = true)]
async fn created_invite_expires_without_polling() {
    let Setup {
        tracker,
        platform,
        clock,
    } = setup();
    platform.set(1, vec![]);
    tracker.bootstrap(&[1]).await;
    tracker.start();
    tracker.wait_for_index_ready().await;
    let mut rx = tracker.subscribe();

    let invite = record(1, "short", 0, 10, clock.now());
    tracker.handle(Notification::InviteCreated(invite)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(9_900)).await;
    assert!(tracker.get_invite_by_code("short").is_some());
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(tracker.get_invite_by_code("short").is_none());
    match rx.try_recv().unwrap() {
        TrackerEvent::InviteExpired { invite } => assert_eq!(invite.code, "short"),
        other => panic!("unexpected event {other:?}"),
    }
    tracker.shutdown();
}

#[tokio::test(start_paused = true)]
async fn new_short_invite_preempts_long_sleep() {
    let Setup {
        tracker,
        platform,
        clock,
    } = setup();
    platform.set(1, vec![record(1, "long", 0, 500, clock.now())]);
    tracker.bootstrap(&[1]).await;
    tracker.start();
    tracker.wait_for_index_ready().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    tracker
        .handle(Notification::InviteCreated(record(1, "quick", 0, 10, clock.now())))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(tracker.get_invite_by_code("quick").is_none());
    assert!(tracker.get_invite_by_code("long").is_some());
    tracker.shutdown();
}

#[tokio::test(start_paused = true)]
async fn channel_delete_removes_its_invites() {
    let Setup {
        tracker, platform, ..
    } = setup();
    let now = Utc::now();
    let mut elsewhere = record(1, "keep", 0, 0, now);
    elsewhere.channel_id = 11;
    platform.set(1, vec![record(1, "gone", 0, 0, now), elsewhere]);
    tracker.bootstrap(&[1]).await;
    let mut rx = tracker.subscribe();

    tracker
        .handle(Notification::ChannelDeleted {
            server_id: 1,
            channel_id: 10,
        })
        .await
        .unwrap();

    assert!(tracker.get_invite_by_code("gone").is_none());
    assert!(tracker.get_invite_by_code("keep").is_some());
    match rx.try_recv().unwrap() {
        TrackerEvent::InviteRemoved { invite, reason } => {
            assert_eq!(invite.code, "gone");
            assert_eq!(reason, RemovalReason::ChannelDeleted);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn deleted_invite_is_removed_once() {
    let Setup {
        tracker, platform, ..
    } = setup();
    platform.set(1, vec![record(1, "bye", 0, 0, Utc::now())]);
    tracker.bootstrap(&[1]).await;
    let mut rx = tracker.subscribe();

    for _ in 0..2 {
        tracker
            .handle(Notification::InviteDeleted {
                server_id: 1,
                code: "bye".into(),
            })
            .await
            .unwrap();
    }

    assert!(matches!(rx.try_recv(), Ok(TrackerEvent::InviteRemoved { .. })));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn malformed_codes_are_rejected() {
    let Setup {
        tracker, platform, ..
    } = setup();
    platform.set(1, vec![]);
    tracker.bootstrap(&[1]).await;

    let err = tracker
        .handle(Notification::InviteCreated(record(1, "no spaces", 0, 0, Utc::now())))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInvite(_)));
    assert!(tracker.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn removed_server_is_dropped_after_grace_period() {
    let Setup {
        tracker, platform, ..
    } = setup();
    platform.set(1, vec![record(1, "aaa", 0, 0, Utc::now())]);
    tracker.bootstrap(&[1]).await;
    let mut rx = tracker.subscribe();

    tracker.handle(Notification::ServerRemoved(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(290)).await;
    assert!(tracker.get_invite_by_code("aaa").is_some());

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(tracker.get_invite_by_code("aaa").is_none());
    assert!(matches!(
        rx.try_recv(),
        Ok(TrackerEvent::ServerDropped { server_id: 1 })
    ));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn server_back_within_grace_keeps_and_refreshes_invites() {
    let Setup {
        tracker, platform, ..
    } = setup();
    platform.set(1, vec![record(1, "aaa", 0, 0, Utc::now())]);
    tracker.bootstrap(&[1]).await;
    let mut rx = tracker.subscribe();

    tracker.handle(Notification::ServerUnavailable(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    platform.set(1, vec![record(1, "aaa", 2, 0, Utc::now())]);
    tracker.handle(Notification::ServerAvailable(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(tracker.get_invite_by_code("aaa").map(|i| i.uses), Some(2));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn joined_server_with_failing_fetch_surfaces_error() {
    let Setup {
        tracker, platform, ..
    } = setup();
    platform.fail(9);
    let err = tracker.handle(Notification::ServerJoined(9)).await.unwrap_err();
    assert!(matches!(err, CoreError::Fetch(PlatformError::Http(_))));
    assert!(tracker.grace().is_visible(9));
}
