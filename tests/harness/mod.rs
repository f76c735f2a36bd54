//! Replica-set harness for recovery integration tests
//!
//! - One `RecoveryBackend` per shard, all sharing a `StaticMembership`
//! - Every message goes through a single `RecordingTransport`
//! - Delivery is driven by hand: `step` delivers one batch, in an order
//!   the test may shuffle, and `pump` repeats until the set is quiet
//!
//! Nothing runs concurrently; tests are deterministic for a given seed.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};

use shard_recovery::observability::MetricsRegistry;
use shard_recovery::replication::{
    Epoch, MemoryObject, MemoryStore, ObjectKey, RecordingTransport, RecoveryBackend,
    RecoveryConfig, RecoveryError, RecoveryMessage, ShardId, StaticMembership, VersionStamp,
};

pub fn shard(id: u32) -> ShardId {
    ShardId::new(id)
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(name)
}

/// Deterministic pseudo-random bytes.
pub fn object_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Fully allocated object with `keys` omap entries.
pub fn full_object(seed: u64, version: VersionStamp, len: usize, keys: usize) -> MemoryObject {
    let data = object_bytes(seed, len);
    let mut object = MemoryObject {
        version,
        omap_header: b"header".to_vec(),
        ..MemoryObject::default()
    };
    for k in 0..keys {
        object
            .omap
            .insert(format!("k{:04}", k), object_bytes(seed + k as u64, 24));
    }
    object.attrs.insert("_".to_string(), version.to_string().into_bytes());
    object.allocated.insert(0, data.len() as u64);
    object.data = data;
    object
}

/// One shard of the harness cluster.
pub struct TestShard {
    pub id: ShardId,
    pub store: Arc<MemoryStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub backend: RecoveryBackend,
}

/// Delivery order of one batch.
#[derive(Debug, Clone, Copy)]
pub enum Order {
    /// As sent
    Fifo,
    /// Last sent first
    Reversed,
    /// Seeded shuffle
    Shuffled(u64),
}

pub struct Cluster {
    pub config: RecoveryConfig,
    pub membership: StaticMembership,
    pub transport: Arc<RecordingTransport>,
    pub shards: Vec<TestShard>,
    /// Handler errors seen during delivery, per receiving shard
    pub errors: Vec<(ShardId, RecoveryError)>,
    /// Messages delivered so far
    pub delivered: usize,
}

impl Cluster {
    /// `replicas` shards at epoch 1; shard 0 is primary.
    pub fn new(replicas: u32, config: RecoveryConfig) -> Self {
        let ids: Vec<ShardId> = (0..replicas).map(ShardId::new).collect();
        let membership = StaticMembership::new(ids.clone(), Epoch::new(1));
        let transport = Arc::new(RecordingTransport::new());

        let shards = ids
            .into_iter()
            .map(|id| {
                let store = Arc::new(MemoryStore::new());
                let metrics = Arc::new(MetricsRegistry::new());
                let backend = RecoveryBackend::new(
                    config.clone(),
                    store.clone(),
                    Arc::new(membership.view(id)),
                    transport.clone(),
                    metrics.clone(),
                )
                .unwrap();
                TestShard {
                    id,
                    store,
                    metrics,
                    backend,
                }
            })
            .collect();

        Self {
            config,
            membership,
            transport,
            shards,
            errors: Vec::new(),
            delivered: 0,
        }
    }

    pub fn shard(&self, id: u32) -> &TestShard {
        &self.shards[id as usize]
    }

    pub fn backend(&mut self, id: u32) -> &mut RecoveryBackend {
        &mut self.shards[id as usize].backend
    }

    pub fn store(&self, id: u32) -> &Arc<MemoryStore> {
        &self.shards[id as usize].store
    }

    /// Replace a shard's backend, keeping its store. Every in-flight
    /// record on that shard is lost.
    pub fn restart(&mut self, id: u32) {
        let shard = &mut self.shards[id as usize];
        shard.backend = RecoveryBackend::new(
            self.config.clone(),
            shard.store.clone(),
            Arc::new(self.membership.view(shard.id)),
            self.transport.clone(),
            shard.metrics.clone(),
        )
        .unwrap();
    }

    /// Take every queued message without delivering it.
    pub fn take_queued(&self) -> Vec<(ShardId, RecoveryMessage)> {
        self.transport.drain()
    }

    /// Deliver one message to `to`.
    pub fn deliver(&mut self, to: ShardId, message: RecoveryMessage) {
        self.delivered += 1;
        let backend = &mut self.shards[to.value() as usize].backend;
        if let Err(e) = backend.handle_message(message) {
            self.errors.push((to, e));
        }
    }

    /// Deliver everything queued right now. Returns the batch size.
    pub fn step(&mut self, order: Order) -> usize {
        let mut batch = self.transport.drain();
        match order {
            Order::Fifo => {}
            Order::Reversed => batch.reverse(),
            Order::Shuffled(seed) => batch.shuffle(&mut StdRng::seed_from_u64(seed)),
        }
        let count = batch.len();
        for (to, message) in batch {
            self.deliver(to, message);
        }
        count
    }

    /// Deliver until no message is queued. Returns the number of batches.
    pub fn pump(&mut self, order: Order) -> usize {
        let mut batches = 0;
        loop {
            let order = match order {
                Order::Shuffled(seed) => Order::Shuffled(seed.wrapping_add(batches as u64)),
                other => other,
            };
            if self.step(order) == 0 {
                return batches;
            }
            batches += 1;
            assert!(batches < 10_000, "recovery did not quiesce");
        }
    }

    /// Object copy held by each shard.
    pub fn copies(&self, object: &ObjectKey) -> BTreeMap<ShardId, Option<MemoryObject>> {
        self.shards
            .iter()
            .map(|s| (s.id, s.store.get(object)))
            .collect()
    }

    /// Assert every shard holds an identical copy of `object` at `version`.
    pub fn assert_converged(&self, object: &ObjectKey, version: VersionStamp) {
        let reference = self.shards[0]
            .store
            .get(object)
            .unwrap_or_else(|| panic!("primary lacks {}", object));
        for shard in &self.shards {
            let copy = shard
                .store
                .get(object)
                .unwrap_or_else(|| panic!("{} lacks {}", shard.id, object));
            assert_eq!(copy.version, version, "{} version", shard.id);
            assert_eq!(copy.data, reference.data, "{} data", shard.id);
            assert_eq!(copy.omap, reference.omap, "{} omap", shard.id);
            assert_eq!(copy.omap_header, reference.omap_header, "{} header", shard.id);
            assert_eq!(copy.attrs, reference.attrs, "{} attrs", shard.id);
        }
    }

    /// Assert no shard holds any recovery record.
    pub fn assert_idle(&self) {
        for shard in &self.shards {
            assert!(
                shard.backend.status().is_idle(),
                "{} still has records: {:?}",
                shard.id,
                shard.backend.status()
            );
        }
    }
}
