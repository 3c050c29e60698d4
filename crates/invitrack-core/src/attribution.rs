use std::sync::Arc;

use invitrack_models::invite::{is_vanity_alias, InviteRecord, InviteSnapshot};
use invitrack_models::member::JoinedMember;

use crate::cache::CommunityInviteCache;
use crate::events::{EventBus, TrackerEvent};
use crate::platform::{fetch_snapshot, Platform};

/// Outcome of comparing two snapshots of the same server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Matched(InviteRecord),
    /// More than one use count moved between the fetches. Candidates are in
    /// code order; which join used which invite cannot be told apart.
    Ambiguous(Vec<InviteRecord>),
    NoMatch,
}

impl MatchResult {
    /// The single invite reported downstream: the match, or the first
    /// candidate by code when ambiguous.
    pub fn primary(&self) -> Option<&InviteRecord> {
        match self {
            MatchResult::Matched(invite) => Some(invite),
            MatchResult::Ambiguous(candidates) => candidates.first(),
            MatchResult::NoMatch => None,
        }
    }

    pub fn candidates(&self) -> &[InviteRecord] {
        match self {
            MatchResult::Matched(invite) => std::slice::from_ref(invite),
            MatchResult::Ambiguous(candidates) => candidates,
            MatchResult::NoMatch => &[],
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, MatchResult::Ambiguous(_))
    }
}

/// Walk both snapshots in code order and collect every invite whose use count
/// went up. Codes present on only one side appeared or vanished between the
/// fetches and are skipped. The vanity alias is compared through its canonical
/// code, so a vanity join is counted once.
pub fn diff(before: &InviteSnapshot, after: &InviteSnapshot) -> MatchResult {
    let mut candidates: Vec<InviteRecord> = after
        .iter()
        .filter(|(code, _)| !is_vanity_alias(code))
        .filter_map(|(code, fresh)| {
            let cached = before.get(code)?;
            (fresh.uses > cached.uses).then(|| fresh.clone())
        })
        .collect();

    match candidates.len() {
        0 => MatchResult::NoMatch,
        1 => MatchResult::Matched(candidates.remove(0)),
        _ => MatchResult::Ambiguous(candidates),
    }
}

#[derive(Debug, Clone)]
pub struct Attribution {
    /// What the cache now holds for the server (the cached snapshot if the fetch failed).
    pub fresh: InviteSnapshot,
    pub result: MatchResult,
}

impl Attribution {
    /// Expiring invites in `fresh` that were not in the snapshot it was compared to.
    pub fn discovered_expiring<'a>(
        &'a self,
        cached: &'a InviteSnapshot,
    ) -> impl Iterator<Item = &'a InviteRecord> + 'a {
        self.fresh
            .iter()
            .filter(move |(code, invite)| !invite.is_permanent() && !cached.contains_key(*code))
            .map(|(_, invite)| invite)
    }
}

/// Guesses which invite a new member used by diffing use counts.
pub struct JoinAttributor {
    cache: Arc<CommunityInviteCache>,
    platform: Arc<dyn Platform>,
    events: EventBus,
}

impl JoinAttributor {
    pub fn new(
        cache: Arc<CommunityInviteCache>,
        platform: Arc<dyn Platform>,
        events: EventBus,
    ) -> Self {
        Self {
            cache,
            platform,
            events,
        }
    }

    /// Fetch a fresh snapshot, diff it against `cached`, and store it.
    /// A failed fetch degrades to `NoMatch` with `cached` returned unchanged.
    pub async fn attribute(&self, server_id: i64, cached: InviteSnapshot) -> Attribution {
        let fresh = match fetch_snapshot(self.platform.as_ref(), server_id).await {
            Ok(fresh) => fresh,
            Err(e) => {
                tracing::warn!(server_id, error = %e, "invite fetch failed, attribution unknown");
                return Attribution {
                    fresh: cached,
                    result: MatchResult::NoMatch,
                };
            }
        };

        let result = diff(&cached, &fresh);

        // The fetch was a suspension point; the server may have been dropped since.
        if !self.cache.replace_if_loaded(server_id, fresh.clone()) {
            tracing::debug!(server_id, "server no longer loaded, fresh snapshot discarded");
        }

        Attribution { fresh, result }
    }

    /// Attribute a join and publish `invite_update`, match or not.
    pub async fn on_member_join(&self, member: JoinedMember) -> (InviteSnapshot, Attribution) {
        let cached = self.cache.snapshot(member.server_id).unwrap_or_default();
        let attribution = self.attribute(member.server_id, cached.clone()).await;

        match &attribution.result {
            MatchResult::Matched(invite) => tracing::info!(
                server_id = member.server_id,
                user_id = member.user_id,
                code = %invite.code,
                "member joined via invite"
            ),
            MatchResult::Ambiguous(candidates) => tracing::info!(
                server_id = member.server_id,
                user_id = member.user_id,
                candidates = candidates.len(),
                "member joined, several invites gained uses"
            ),
            MatchResult::NoMatch => tracing::info!(
                server_id = member.server_id,
                user_id = member.user_id,
                "member joined via unknown invite"
            ),
        }

        let ambiguous = if attribution.result.is_ambiguous() {
            attribution.result.candidates().to_vec()
        } else {
            Vec::new()
        };
        self.events.publish(TrackerEvent::InviteUpdate {
            member,
            invite: attribution.result.primary().cloned(),
            ambiguous,
        });

        (cached, attribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakePlatform;
    use crate::platform::test_support::invite;
    use chrono::Utc;
    use invitrack_models::invite::VANITY_ALIAS;

    fn snapshot(server_id: i64, uses: &[(&str, u32)]) -> InviteSnapshot {
        uses.iter()
            .map(|(code, n)| (code.to_string(), invite(server_id, code, *n)))
            .collect()
    }

    fn member(server_id: i64) -> JoinedMember {
        JoinedMember {
            server_id,
            user_id: 42,
            username: Some("ada".into()),
            bot: false,
            joined_at: Utc::now(),
        }
    }

    fn attributor(platform: Arc<FakePlatform>) -> (JoinAttributor, Arc<CommunityInviteCache>, EventBus) {
        let cache = Arc::new(CommunityInviteCache::new());
        let events = EventBus::new(16);
        let attributor = JoinAttributor::new(cache.clone(), platform, events.clone());
        (attributor, cache, events)
    }

    #[test]
    fn single_increment_matches() {
        let before = snapshot(1, &[("A", 5), ("B", 2)]);
        let after = snapshot(1, &[("A", 5), ("B", 3)]);
        assert_eq!(diff(&before, &after).primary().map(|i| i.code.as_str()), Some("B"));
        assert!(matches!(diff(&before, &after), MatchResult::Matched(_)));
    }

    #[test]
    fn double_increment_is_ambiguous_and_picks_first_code() {
        let before = snapshot(1, &[("A", 5), ("B", 2)]);
        let after = snapshot(1, &[("B", 3), ("A", 6)]);
        let result = diff(&before, &after);

        assert!(result.is_ambiguous());
        let codes: Vec<_> = result.candidates().iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["A", "B"]);
        assert_eq!(result.primary().map(|i| i.code.as_str()), Some("A"));
    }

    #[test]
    fn unchanged_uses_is_no_match() {
        let before = snapshot(1, &[("A", 5), ("B", 2)]);
        assert_eq!(diff(&before, &before.clone()), MatchResult::NoMatch);
        assert_eq!(diff(&InviteSnapshot::new(), &InviteSnapshot::new()), MatchResult::NoMatch);
    }

    #[test]
    fn drift_between_fetches_is_skipped() {
        // "B" was deleted and "C" created between the two fetches.
        let before = snapshot(1, &[("A", 5), ("B", 2)]);
        let after = snapshot(1, &[("A", 5), ("C", 1)]);
        assert_eq!(diff(&before, &after), MatchResult::NoMatch);
    }

    #[test]
    fn vanity_join_counts_once() {
        let mut before = snapshot(1, &[("abc", 1)]);
        let vanity = invite(1, "rustaceans", 10);
        before.insert(vanity.code.clone(), vanity.clone());
        before.insert(VANITY_ALIAS.into(), vanity);

        let mut after = snapshot(1, &[("abc", 1)]);
        let used = invite(1, "rustaceans", 11);
        after.insert(used.code.clone(), used.clone());
        after.insert(VANITY_ALIAS.into(), used.clone());

        let result = diff(&before, &after);
        assert_eq!(result.candidates().len(), 1);
        assert_eq!(result, MatchResult::Matched(used));
    }

    #[tokio::test]
    async fn attribute_stores_fresh_snapshot() {
        let platform = Arc::new(FakePlatform::default());
        platform.set_invites(1, vec![invite(1, "A", 5), invite(1, "B", 2)]);
        let (attributor, cache, _) = attributor(platform.clone());
        let cached = cache.load(platform.as_ref(), 1).await.unwrap();

        platform.set_invites(1, vec![invite(1, "A", 5), invite(1, "B", 3)]);
        let attribution = attributor.attribute(1, cached).await;

        assert_eq!(attribution.result.primary().map(|i| i.code.as_str()), Some("B"));
        assert_eq!(cache.get("B").map(|i| i.uses), Some(3));
    }

    #[tokio::test]
    async fn fetch_failure_returns_cached_and_no_match() {
        let platform = Arc::new(FakePlatform::default());
        platform.set_invites(1, vec![invite(1, "A", 5)]);
        let (attributor, cache, _) = attributor(platform.clone());
        let cached = cache.load(platform.as_ref(), 1).await.unwrap();

        platform.fail(1, true);
        let attribution = attributor.attribute(1, cached.clone()).await;

        assert_eq!(attribution.fresh, cached);
        assert_eq!(attribution.result, MatchResult::NoMatch);
        assert_eq!(cache.snapshot(1), Some(cached));
    }

    #[tokio::test]
    async fn dropped_server_is_not_resurrected() {
        let platform = Arc::new(FakePlatform::default());
        platform.set_invites(1, vec![invite(1, "A", 6)]);
        let (attributor, cache, _) = attributor(platform);

        let attribution = attributor.attribute(1, snapshot(1, &[("A", 5)])).await;

        assert!(matches!(attribution.result, MatchResult::Matched(_)));
        assert!(!cache.is_loaded(1));
    }

    #[tokio::test]
    async fn member_join_publishes_even_without_match() {
        let platform = Arc::new(FakePlatform::default());
        platform.set_invites(1, vec![invite(1, "A", 5)]);
        let (attributor, cache, events) = attributor(platform.clone());
        cache.load(platform.as_ref(), 1).await.unwrap();
        let mut rx = events.subscribe();

        attributor.on_member_join(member(1)).await;

        match rx.try_recv().unwrap() {
            TrackerEvent::InviteUpdate { member, invite, ambiguous } => {
                assert_eq!(member.user_id, 42);
                assert!(invite.is_none());
                assert!(ambiguous.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn member_join_reports_ambiguous_candidates() {
        let platform = Arc::new(FakePlatform::default());
        platform.set_invites(1, vec![invite(1, "A", 5), invite(1, "B", 2)]);
        let (attributor, cache, events) = attributor(platform.clone());
        cache.load(platform.as_ref(), 1).await.unwrap();
        let mut rx = events.subscribe();

        platform.set_invites(1, vec![invite(1, "A", 6), invite(1, "B", 3)]);
        attributor.on_member_join(member(1)).await;

        match rx.try_recv().unwrap() {
            TrackerEvent::InviteUpdate { invite, ambiguous, .. } => {
                assert_eq!(invite.map(|i| i.code), Some("A".to_string()));
                assert_eq!(ambiguous.len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn discovered_expiring_lists_new_timed_invites() {
        let cached = snapshot(1, &[("A", 1)]);
        let mut fresh = cached.clone();
        let mut timed = invite(1, "T", 0);
        timed.max_age = 60;
        fresh.insert("T".into(), timed);
        fresh.insert("P".into(), invite(1, "P", 0));

        let attribution = Attribution {
            fresh,
            result: MatchResult::NoMatch,
        };
        let codes: Vec<_> = attribution
            .discovered_expiring(&cached)
            .map(|i| i.code.as_str())
            .collect();
        assert_eq!(codes, vec!["T"]);
    }
}
