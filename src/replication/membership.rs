//! Membership authority collaborator
//!
//! The authority owns the shard's epoch and the missing sets. Recovery
//! never computes what is missing; it asks, recovers, and reports back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use super::types::{Epoch, MissingItem, ObjectKey, ShardId, VersionStamp};

/// Membership authority trait consumed by recovery.
pub trait Membership: Send + Sync + std::fmt::Debug {
    /// Current membership epoch, read at the moment of the call.
    fn current_epoch(&self) -> Epoch;

    /// Shard this recovery instance runs on.
    fn local_shard(&self) -> ShardId;

    fn is_primary_for(&self, object: &ObjectKey) -> bool;

    /// What `shard` is missing for `object`, if anything.
    fn missing_item(&self, shard: ShardId, object: &ObjectKey) -> Option<MissingItem>;

    /// Peer shards (never the local one) that need `object`.
    fn shards_needing(&self, object: &ObjectKey) -> BTreeSet<ShardId>;

    /// Peer holding an up-to-date copy of `object`.
    fn pull_source(&self, object: &ObjectKey) -> Option<ShardId>;

    /// Clear `shard`'s missing entry for `object`.
    fn mark_recovered(&self, shard: ShardId, object: &ObjectKey, version: VersionStamp);

    /// Every shard now holds `object` at `version`.
    fn mark_object_recovered(&self, object: &ObjectKey, version: VersionStamp);
}

#[derive(Debug)]
struct MembershipState {
    epoch: Epoch,
    acting: BTreeSet<ShardId>,
    primary: Option<ShardId>,
    missing: BTreeMap<(ShardId, ObjectKey), MissingItem>,
    sources: BTreeMap<ObjectKey, ShardId>,
    recovered: Vec<(ObjectKey, VersionStamp)>,
}

/// Explicitly configured membership, shared by every shard of one
/// replica set. Each shard gets its own view via `view`.
#[derive(Debug, Clone)]
pub struct StaticMembership {
    local: ShardId,
    state: Arc<RwLock<MembershipState>>,
}

impl StaticMembership {
    /// Replica set `acting` whose first member is primary.
    pub fn new(acting: impl IntoIterator<Item = ShardId>, epoch: Epoch) -> Self {
        let acting: BTreeSet<ShardId> = acting.into_iter().collect();
        let primary = acting.iter().next().copied();
        let local = primary.unwrap_or_else(|| ShardId::new(0));
        Self {
            local,
            state: Arc::new(RwLock::new(MembershipState {
                epoch,
                acting,
                primary,
                missing: BTreeMap::new(),
                sources: BTreeMap::new(),
                recovered: Vec::new(),
            })),
        }
    }

    /// View of the same membership from `shard`.
    pub fn view(&self, shard: ShardId) -> Self {
        Self {
            local: shard,
            state: Arc::clone(&self.state),
        }
    }

    pub fn acting(&self) -> BTreeSet<ShardId> {
        self.state
            .read()
            .map(|s| s.acting.clone())
            .unwrap_or_default()
    }

    pub fn set_primary(&self, shard: ShardId) {
        if let Ok(mut state) = self.state.write() {
            state.primary = Some(shard);
        }
    }

    pub fn add_missing(&self, shard: ShardId, object: ObjectKey, item: MissingItem) {
        if let Ok(mut state) = self.state.write() {
            state.missing.insert((shard, object), item);
        }
    }

    pub fn set_pull_source(&self, object: ObjectKey, shard: ShardId) {
        if let Ok(mut state) = self.state.write() {
            state.sources.insert(object, shard);
        }
    }

    pub fn set_epoch(&self, epoch: Epoch) {
        if let Ok(mut state) = self.state.write() {
            state.epoch = epoch;
        }
    }

    /// Bump the epoch and return the new value.
    pub fn advance_epoch(&self) -> Epoch {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.epoch = state.epoch.next();
        state.epoch
    }

    pub fn is_missing(&self, shard: ShardId, object: &ObjectKey) -> bool {
        self.missing_item(shard, object).is_some()
    }

    /// Objects reported fully recovered, in order.
    pub fn recovered_objects(&self) -> Vec<(ObjectKey, VersionStamp)> {
        self.state
            .read()
            .map(|s| s.recovered.clone())
            .unwrap_or_default()
    }
}

impl Membership for StaticMembership {
    fn current_epoch(&self) -> Epoch {
        self.state
            .read()
            .map(|s| s.epoch)
            .unwrap_or_else(|poisoned| poisoned.into_inner().epoch)
    }

    fn local_shard(&self) -> ShardId {
        self.local
    }

    fn is_primary_for(&self, _object: &ObjectKey) -> bool {
        self.state
            .read()
            .map(|s| s.primary == Some(self.local))
            .unwrap_or(false)
    }

    fn missing_item(&self, shard: ShardId, object: &ObjectKey) -> Option<MissingItem> {
        self.state
            .read()
            .ok()?
            .missing
            .get(&(shard, object.clone()))
            .cloned()
    }

    fn shards_needing(&self, object: &ObjectKey) -> BTreeSet<ShardId> {
        let Ok(state) = self.state.read() else {
            return BTreeSet::new();
        };
        state
            .missing
            .keys()
            .filter(|(shard, obj)| obj == object && *shard != self.local)
            .map(|(shard, _)| *shard)
            .collect()
    }

    fn pull_source(&self, object: &ObjectKey) -> Option<ShardId> {
        let state = self.state.read().ok()?;
        if let Some(shard) = state.sources.get(object) {
            return Some(*shard);
        }
        state
            .acting
            .iter()
            .copied()
            .find(|s| *s != self.local && !state.missing.contains_key(&(*s, object.clone())))
    }

    fn mark_recovered(&self, shard: ShardId, object: &ObjectKey, version: VersionStamp) {
        if let Ok(mut state) = self.state.write() {
            let key = (shard, object.clone());
            // Only clear if nothing newer has been reported meanwhile.
            if state.missing.get(&key).map_or(false, |m| m.need <= version) {
                state.missing.remove(&key);
            }
        }
    }

    fn mark_object_recovered(&self, object: &ObjectKey, version: VersionStamp) {
        if let Ok(mut state) = self.state.write() {
            state.recovered.push((object.clone(), version));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(ids: &[u32]) -> Vec<ShardId> {
        ids.iter().map(|i| ShardId::new(*i)).collect()
    }

    #[test]
    fn test_first_acting_member_is_primary() {
        let m = StaticMembership::new(shards(&[0, 1, 2]), Epoch::new(1));
        let obj = ObjectKey::new("a");
        assert!(m.is_primary_for(&obj));
        assert!(!m.view(ShardId::new(1)).is_primary_for(&obj));
    }

    #[test]
    fn test_shards_needing_excludes_local() {
        let m = StaticMembership::new(shards(&[0, 1, 2]), Epoch::new(1));
        let obj = ObjectKey::new("a");
        for s in shards(&[0, 1, 2]) {
            m.add_missing(s, obj.clone(), MissingItem::whole(VersionStamp::new(1, 1)));
        }
        assert_eq!(m.shards_needing(&obj), shards(&[1, 2]).into_iter().collect());
    }

    #[test]
    fn test_pull_source_prefers_shard_not_missing() {
        let m = StaticMembership::new(shards(&[0, 1, 2]), Epoch::new(1));
        let obj = ObjectKey::new("a");
        m.add_missing(ShardId::new(0), obj.clone(), MissingItem::whole(VersionStamp::new(1, 1)));
        m.add_missing(ShardId::new(1), obj.clone(), MissingItem::whole(VersionStamp::new(1, 1)));
        assert_eq!(m.pull_source(&obj), Some(ShardId::new(2)));
    }

    #[test]
    fn test_mark_recovered_respects_newer_need() {
        let m = StaticMembership::new(shards(&[0, 1]), Epoch::new(1));
        let obj = ObjectKey::new("a");
        m.add_missing(ShardId::new(1), obj.clone(), MissingItem::whole(VersionStamp::new(1, 5)));

        m.mark_recovered(ShardId::new(1), &obj, VersionStamp::new(1, 4));
        assert!(m.is_missing(ShardId::new(1), &obj));
        m.mark_recovered(ShardId::new(1), &obj, VersionStamp::new(1, 5));
        assert!(!m.is_missing(ShardId::new(1), &obj));
    }

    #[test]
    fn test_views_share_epoch() {
        let m = StaticMembership::new(shards(&[0, 1]), Epoch::new(1));
        let replica = m.view(ShardId::new(1));
        m.advance_epoch();
        assert_eq!(replica.current_epoch(), Epoch::new(2));
    }
}
