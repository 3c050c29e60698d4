use dashmap::DashMap;
use invitrack_models::invite::{is_vanity_alias, InviteRecord, InviteSnapshot, VANITY_ALIAS};
use thiserror::Error;

use crate::platform::{fetch_snapshot, Platform, PlatformError};

/// A failed [`CommunityInviteCache::load`]. The cache is left as it was;
/// `previous` is what it still holds for the server (empty if never loaded).
#[derive(Debug, Error)]
#[error("invite fetch for server {server_id} failed: {source}")]
pub struct LoadFailure {
    pub server_id: i64,
    pub previous: InviteSnapshot,
    pub source: PlatformError,
}

/// In-memory index: Server -> (Code -> Invite).
///
/// A server key exists for every loaded server, even one with no invites.
/// Every mutation takes the shard guard for a synchronous closure only, so
/// nothing here holds a lock across an await or waits on the scheduler.
pub struct CommunityInviteCache {
    servers: DashMap<i64, InviteSnapshot>,
}

impl CommunityInviteCache {
    pub fn new() -> Self {
        CommunityInviteCache {
            servers: DashMap::new(),
        }
    }

    /// Fetch the server's invites and swap in the new map whole.
    pub async fn load(
        &self,
        platform: &dyn Platform,
        server_id: i64,
    ) -> Result<InviteSnapshot, LoadFailure> {
        match fetch_snapshot(platform, server_id).await {
            Ok(snapshot) => {
                self.servers.insert(server_id, snapshot.clone());
                tracing::debug!(server_id, invites = snapshot.len(), "server invites loaded");
                Ok(snapshot)
            }
            Err(source) => Err(LoadFailure {
                server_id,
                previous: self.snapshot(server_id).unwrap_or_default(),
                source,
            }),
        }
    }

    /// Replace the map for a server that is still loaded. Returns false when the
    /// server was dropped in the meantime, leaving it dropped.
    pub fn replace_if_loaded(&self, server_id: i64, snapshot: InviteSnapshot) -> bool {
        match self.servers.get_mut(&server_id) {
            Some(mut entry) => {
                *entry = snapshot;
                true
            }
            None => false,
        }
    }

    /// Insert or replace one invite. No-op for servers that are not loaded.
    pub fn upsert(&self, record: InviteRecord) -> bool {
        let Some(mut invites) = self.servers.get_mut(&record.server_id) else {
            return false;
        };
        if let Some(alias) = invites.get_mut(VANITY_ALIAS) {
            if alias.code == record.code {
                *alias = record.clone();
            }
        }
        invites.insert(record.code.clone(), record);
        true
    }

    pub fn remove(&self, server_id: i64, code: &str) -> Option<InviteRecord> {
        let mut invites = self.servers.get_mut(&server_id)?;
        let removed = invites.remove(code)?;
        // Keep the vanity alias and its canonical entry together.
        if is_vanity_alias(code) {
            invites.remove(&removed.code);
        } else if invites
            .get(VANITY_ALIAS)
            .is_some_and(|alias| alias.code == removed.code)
        {
            invites.remove(VANITY_ALIAS);
        }
        Some(removed)
    }

    /// Remove `record` only if the cache still holds that same invite under its code.
    pub fn remove_if_same(&self, record: &InviteRecord) -> bool {
        let Some(invites) = self.servers.get(&record.server_id) else {
            return false;
        };
        let same = invites
            .get(&record.code)
            .is_some_and(|cached| cached.same_invite(record));
        drop(invites);
        same && self.remove(record.server_id, &record.code).is_some()
    }

    /// Remove every invite pointing at a deleted channel.
    pub fn remove_by_channel(&self, server_id: i64, channel_id: i64) -> Vec<InviteRecord> {
        let Some(mut invites) = self.servers.get_mut(&server_id) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        invites.retain(|key, invite| {
            if invite.channel_id != channel_id {
                return true;
            }
            if !is_vanity_alias(key) {
                removed.push(invite.clone());
            }
            false
        });
        removed
    }

    /// Forget a server entirely.
    pub fn drop_server(&self, server_id: i64) -> bool {
        self.servers.remove(&server_id).is_some()
    }

    /// Look up a code in any server. The vanity alias is shared by every server
    /// that has one, so it never matches here; look it up with [`Self::get_in`].
    pub fn get(&self, code: &str) -> Option<InviteRecord> {
        if is_vanity_alias(code) {
            return None;
        }
        self.servers
            .iter()
            .find_map(|invites| invites.get(code).cloned())
    }

    pub fn get_in(&self, server_id: i64, code: &str) -> Option<InviteRecord> {
        self.servers.get(&server_id)?.get(code).cloned()
    }

    pub fn snapshot(&self, server_id: i64) -> Option<InviteSnapshot> {
        self.servers.get(&server_id).map(|invites| invites.clone())
    }

    pub fn is_loaded(&self, server_id: i64) -> bool {
        self.servers.contains_key(&server_id)
    }

    pub fn server_ids(&self) -> Vec<i64> {
        self.servers.iter().map(|entry| *entry.key()).collect()
    }

    /// Every distinct invite across all servers. Vanity aliases are not repeated.
    pub fn flatten(&self) -> Vec<InviteRecord> {
        self.servers
            .iter()
            .flat_map(|invites| {
                invites
                    .iter()
                    .filter(|(key, _)| !is_vanity_alias(key))
                    .map(|(_, invite)| invite.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of distinct cached invites.
    pub fn len(&self) -> usize {
        self.servers
            .iter()
            .map(|invites| invites.keys().filter(|key| !is_vanity_alias(key)).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommunityInviteCache {
    fn default() -> Self {
        Self::new()
    }
}
