//! Object store collaborator
//!
//! Recovery reads source objects through `ObjectStore` and persists recovered
//! state by submitting a `Transaction`. A transaction is built up by exactly
//! one recovery at a time and applied all-or-nothing on `submit`.
//!
//! `MemoryStore` is the in-process implementation used by the simulation
//! and the tests. It tracks allocated extents so sparse objects keep their
//! holes, and supports fault injection.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use thiserror::Error;

use super::errors::RecoveryError;
use super::interval::IntervalSet;
use super::types::{ObjectKey, VersionStamp};

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectKey),

    #[error("object corrupted: {0}: {1}")]
    Corrupted(ObjectKey, String),

    #[error("store failure on {0}: {1}")]
    Failed(ObjectKey, String),
}

impl From<StoreError> for RecoveryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(object) => RecoveryError::ObjectNotFound(object),
            StoreError::Corrupted(object, msg) => RecoveryError::ObjectCorrupted(object, msg),
            StoreError::Failed(object, msg) => RecoveryError::StoreCommitFailed(object, msg),
        }
    }
}

/// Object metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub version: VersionStamp,
    pub size: u64,
}

/// One transaction operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    Remove,
    Touch,
    Truncate(u64),
    Write { offset: u64, data: Vec<u8> },
    Zero { offset: u64, len: u64 },
    OmapClear,
    OmapSetHeader(Vec<u8>),
    OmapSetKeys(BTreeMap<String, Vec<u8>>),
    SetAttrs(BTreeMap<String, Vec<u8>>),
    SetVersion(VersionStamp),
}

/// Ordered mutations of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    object: ObjectKey,
    ops: Vec<TxOp>,
}

impl Transaction {
    pub fn new(object: ObjectKey) -> Self {
        Self {
            object,
            ops: Vec::new(),
        }
    }

    pub fn object(&self) -> &ObjectKey {
        &self.object
    }

    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn remove(&mut self) {
        self.ops.push(TxOp::Remove);
    }

    /// Delete the object. Same as `remove`; named for tombstones.
    pub fn delete(&mut self) {
        self.remove();
    }

    pub fn touch(&mut self) {
        self.ops.push(TxOp::Touch);
    }

    pub fn truncate(&mut self, size: u64) {
        self.ops.push(TxOp::Truncate(size));
    }

    pub fn write(&mut self, offset: u64, data: Vec<u8>) {
        if !data.is_empty() {
            self.ops.push(TxOp::Write { offset, data });
        }
    }

    pub fn zero(&mut self, offset: u64, len: u64) {
        if len > 0 {
            self.ops.push(TxOp::Zero { offset, len });
        }
    }

    pub fn clear_omap(&mut self) {
        self.ops.push(TxOp::OmapClear);
    }

    pub fn set_omap_header(&mut self, header: Vec<u8>) {
        self.ops.push(TxOp::OmapSetHeader(header));
    }

    pub fn write_omap(&mut self, entries: BTreeMap<String, Vec<u8>>) {
        if !entries.is_empty() {
            self.ops.push(TxOp::OmapSetKeys(entries));
        }
    }

    pub fn set_attrs(&mut self, attrs: BTreeMap<String, Vec<u8>>) {
        self.ops.push(TxOp::SetAttrs(attrs));
    }

    pub fn set_version(&mut self, version: VersionStamp) {
        self.ops.push(TxOp::SetVersion(version));
    }
}

/// Store trait consumed by recovery.
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Metadata, or `None` if the object does not exist.
    fn stat(&self, object: &ObjectKey) -> StoreResult<Option<ObjectMeta>>;

    /// Allocated extents of the object within `within`.
    fn extents(&self, object: &ObjectKey, within: &IntervalSet) -> StoreResult<IntervalSet>;

    /// Read `[offset, offset + len)`.
    fn read(&self, object: &ObjectKey, offset: u64, len: u64) -> StoreResult<Vec<u8>>;

    fn omap_header(&self, object: &ObjectKey) -> StoreResult<Vec<u8>>;

    /// Up to `max_entries` omap entries strictly after `after`, in key order.
    /// The flag is true when no entries remain past the returned ones.
    fn omap_entries(
        &self,
        object: &ObjectKey,
        after: Option<&str>,
        max_entries: usize,
    ) -> StoreResult<(Vec<(String, Vec<u8>)>, bool)>;

    fn attrs(&self, object: &ObjectKey) -> StoreResult<BTreeMap<String, Vec<u8>>>;

    fn begin_transaction(&self, object: &ObjectKey) -> Transaction {
        Transaction::new(object.clone())
    }

    /// Apply all operations atomically.
    fn submit(&self, tx: Transaction) -> StoreResult<()>;
}

/// In-memory object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryObject {
    pub version: VersionStamp,
    pub data: Vec<u8>,
    /// Extents holding written data; everything else reads as zero
    pub allocated: IntervalSet,
    pub omap_header: Vec<u8>,
    pub omap: BTreeMap<String, Vec<u8>>,
    pub attrs: BTreeMap<String, Vec<u8>>,
}

impl MemoryObject {
    fn apply(&mut self, op: TxOp) {
        match op {
            TxOp::Remove | TxOp::Touch => {}
            TxOp::Truncate(size) => {
                self.data.resize(size as usize, 0);
                self.allocated = self.allocated.clipped(size);
            }
            TxOp::Write { offset, data } => {
                let end = offset as usize + data.len();
                if self.data.len() < end {
                    self.data.resize(end, 0);
                }
                self.data[offset as usize..end].copy_from_slice(&data);
                self.allocated.insert(offset, data.len() as u64);
            }
            TxOp::Zero { offset, len } => {
                let end = (offset + len) as usize;
                if self.data.len() < end {
                    self.data.resize(end, 0);
                }
                self.data[offset as usize..end].fill(0);
                self.allocated = self.allocated.subtract(&IntervalSet::from_range(offset, len));
            }
            TxOp::OmapClear => {
                self.omap.clear();
                self.omap_header.clear();
            }
            TxOp::OmapSetHeader(header) => self.omap_header = header,
            TxOp::OmapSetKeys(entries) => self.omap.extend(entries),
            TxOp::SetAttrs(attrs) => self.attrs = attrs,
            TxOp::SetVersion(version) => self.version = version,
        }
    }
}

/// In-memory store with fault injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ObjectKey, MemoryObject>>,
    corrupted: RwLock<HashSet<ObjectKey>>,
    fail_next_submit: AtomicBool,
    submits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fully allocated object.
    pub fn put_object(&self, object: ObjectKey, version: VersionStamp, data: Vec<u8>) {
        let allocated = IntervalSet::from_range(0, data.len() as u64);
        self.insert(
            object,
            MemoryObject {
                version,
                data,
                allocated,
                ..MemoryObject::default()
            },
        );
    }

    /// Store a sparse object of `size` bytes with only `extents` allocated.
    pub fn put_sparse(
        &self,
        object: ObjectKey,
        version: VersionStamp,
        size: u64,
        extents: &[(u64, Vec<u8>)],
    ) {
        let mut obj = MemoryObject {
            version,
            data: vec![0; size as usize],
            ..MemoryObject::default()
        };
        for (offset, bytes) in extents {
            obj.apply(TxOp::Write {
                offset: *offset,
                data: bytes.clone(),
            });
        }
        obj.apply(TxOp::Truncate(size));
        self.insert(object, obj);
    }

    pub fn insert(&self, object: ObjectKey, obj: MemoryObject) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(object, obj);
        }
    }

    /// Mutate an object in place (test setup).
    pub fn update<F: FnOnce(&mut MemoryObject)>(&self, object: &ObjectKey, f: F) {
        if let Ok(mut objects) = self.objects.write() {
            if let Some(obj) = objects.get_mut(object) {
                f(obj);
            }
        }
    }

    pub fn get(&self, object: &ObjectKey) -> Option<MemoryObject> {
        self.objects.read().ok()?.get(object).cloned()
    }

    pub fn contains(&self, object: &ObjectKey) -> bool {
        self.get(object).is_some()
    }

    /// Make every read of `object` fail.
    pub fn corrupt(&self, object: &ObjectKey) {
        if let Ok(mut corrupted) = self.corrupted.write() {
            corrupted.insert(object.clone());
        }
    }

    /// Reject the next submitted transaction.
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::SeqCst);
    }

    /// Number of transactions applied so far.
    pub fn submits(&self) -> u64 {
        self.submits.load(Ordering::SeqCst)
    }

    /// Run `f` against `object` in place, under the read lock.
    fn with_readable<T>(
        &self,
        object: &ObjectKey,
        f: impl FnOnce(&MemoryObject) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let corrupted = self
            .corrupted
            .read()
            .map(|c| c.contains(object))
            .unwrap_or(false);
        if corrupted {
            return Err(StoreError::Corrupted(
                object.clone(),
                "checksum mismatch".to_string(),
            ));
        }
        let objects = self
            .objects
            .read()
            .map_err(|_| StoreError::Failed(object.clone(), "lock poisoned".to_string()))?;
        let obj = objects
            .get(object)
            .ok_or_else(|| StoreError::NotFound(object.clone()))?;
        f(obj)
    }
}

impl ObjectStore for MemoryStore {
    fn stat(&self, object: &ObjectKey) -> StoreResult<Option<ObjectMeta>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| StoreError::Failed(object.clone(), "lock poisoned".to_string()))?;
        Ok(objects.get(object).map(|obj| ObjectMeta {
            version: obj.version,
            size: obj.data.len() as u64,
        }))
    }

    fn extents(&self, object: &ObjectKey, within: &IntervalSet) -> StoreResult<IntervalSet> {
        self.with_readable(object, |obj| Ok(obj.allocated.intersection(within)))
    }

    fn read(&self, object: &ObjectKey, offset: u64, len: u64) -> StoreResult<Vec<u8>> {
        self.with_readable(object, |obj| {
            let end = offset.saturating_add(len);
            if end > obj.data.len() as u64 {
                return Err(StoreError::Corrupted(
                    object.clone(),
                    format!("read past end: {}..{} of {}", offset, end, obj.data.len()),
                ));
            }
            Ok(obj.data[offset as usize..end as usize].to_vec())
        })
    }

    fn omap_header(&self, object: &ObjectKey) -> StoreResult<Vec<u8>> {
        self.with_readable(object, |obj| Ok(obj.omap_header.clone()))
    }

    fn omap_entries(
        &self,
        object: &ObjectKey,
        after: Option<&str>,
        max_entries: usize,
    ) -> StoreResult<(Vec<(String, Vec<u8>)>, bool)> {
        self.with_readable(object, |obj| {
            let mut remaining = obj
                .omap
                .iter()
                .filter(|(k, _)| after.map_or(true, |a| k.as_str() > a));
            let entries: Vec<_> = remaining
                .by_ref()
                .take(max_entries)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let exhausted = remaining.next().is_none();
            Ok((entries, exhausted))
        })
    }

    fn attrs(&self, object: &ObjectKey) -> StoreResult<BTreeMap<String, Vec<u8>>> {
        self.with_readable(object, |obj| Ok(obj.attrs.clone()))
    }

    fn submit(&self, tx: Transaction) -> StoreResult<()> {
        if self.fail_next_submit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Failed(
                tx.object.clone(),
                "injected submit failure".to_string(),
            ));
        }
        let mut objects = self
            .objects
            .write()
            .map_err(|_| StoreError::Failed(tx.object.clone(), "lock poisoned".to_string()))?;

        let Transaction { object, ops } = tx;
        let mut working = objects.get(&object).cloned();
        for op in ops {
            match op {
                TxOp::Remove => working = None,
                TxOp::Touch => {
                    working.get_or_insert_with(MemoryObject::default);
                }
                other => working.get_or_insert_with(MemoryObject::default).apply(other),
            }
        }
        match working {
            Some(obj) => {
                objects.insert(object, obj);
            }
            None => {
                objects.remove(&object);
            }
        }
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
