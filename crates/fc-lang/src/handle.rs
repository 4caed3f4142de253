//! Process-wide handle table.
//!
//! The table is the only way an external caller refers to a live object.
//! Handles come from a monotonic counter, are never zero, and are never
//! reused. Entries live in a sharded concurrent map so lookups from many
//! connections do not serialize on one lock.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::adapter::BridgedObject;
use crate::error::BridgeError;

/// Opaque 63-bit non-zero object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Handle(NonZeroU64);

impl Handle {
    /// Largest value a handle may take (fits a signed 64-bit integer).
    pub const MAX: u64 = i64::MAX as u64;

    /// Validate a raw identifier received from a caller.
    pub fn from_raw(raw: u64) -> Result<Self, BridgeError> {
        NonZeroU64::new(raw)
            .filter(|v| v.get() <= Self::MAX)
            .map(Self)
            .ok_or(BridgeError::InvalidHandle(raw))
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of object kinds the bridge can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Selection,
    Subscription,
    ParseResult,
    Device,
    ProtoDescriptor,
    FileHandle,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Selection => "selection",
            ObjectKind::Subscription => "subscription",
            ObjectKind::ParseResult => "parse_result",
            ObjectKind::Device => "device",
            ObjectKind::ProtoDescriptor => "proto_descriptor",
            ObjectKind::FileHandle => "file_handle",
        }
    }

    /// Whether `op` is legal on objects of this kind.
    pub fn supports(self, op: Operation) -> bool {
        use Operation::*;
        match self {
            ObjectKind::Selection => {
                matches!(op, Read | Write | Action | Find | Subscribe | Edit)
            }
            ObjectKind::Subscription => matches!(op, Unsubscribe),
            ObjectKind::ParseResult => matches!(op, Read | OpenRoot | Describe),
            ObjectKind::Device => matches!(op, Read | Find | AddModule),
            ObjectKind::ProtoDescriptor | ObjectKind::FileHandle => matches!(op, Read),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations a caller can request against a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
    Action,
    Find,
    Subscribe,
    Unsubscribe,
    Edit,
    OpenRoot,
    Describe,
    AddModule,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Action => "action",
            Operation::Find => "find",
            Operation::Subscribe => "subscribe",
            Operation::Unsubscribe => "unsubscribe",
            Operation::Edit => "edit",
            Operation::OpenRoot => "open_root",
            Operation::Describe => "describe",
            Operation::AddModule => "add_module",
        };
        f.write_str(s)
    }
}

/// Identity of one accepted socket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who is responsible for releasing a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Created in-process (driver API or C entry point); released explicitly.
    Process,
    /// Released when the connection goes away.
    Connection(ConnectionId),
}

struct HandleEntry {
    owner: Owner,
    object: BridgedObject,
}

pub struct HandleTable {
    next: AtomicU64,
    entries: DashMap<Handle, HandleEntry>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
            entries: DashMap::new(),
        }
    }

    /// Register `object` and return its fresh handle.
    ///
    /// The handle is only resolvable once this returns.
    pub fn allocate(&self, object: BridgedObject, owner: Owner) -> Handle {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let hnd = Handle(NonZeroU64::MIN.saturating_add(n));
        tracing::trace!(hnd = %hnd, kind = %object.kind(), ?owner, "Allocated handle");
        self.entries.insert(hnd, HandleEntry { owner, object });
        hnd
    }

    pub fn resolve(&self, hnd: Handle) -> Result<BridgedObject, BridgeError> {
        self.entries
            .get(&hnd)
            .map(|e| e.object.clone())
            .ok_or(BridgeError::InvalidHandle(hnd.get()))
    }

    /// Resolve a raw wire identifier.
    pub fn resolve_raw(&self, raw: u64) -> Result<(Handle, BridgedObject), BridgeError> {
        let hnd = Handle::from_raw(raw)?;
        Ok((hnd, self.resolve(hnd)?))
    }

    /// Resolve and check that the object's kind allows `op`.
    ///
    /// Both failures surface before any adapter code runs.
    pub fn require(&self, raw: u64, op: Operation) -> Result<BridgedObject, BridgeError> {
        let (_, object) = self.resolve_raw(raw)?;
        let kind = object.kind();
        if !kind.supports(op) {
            return Err(BridgeError::UnsupportedOperation { kind, op });
        }
        Ok(object)
    }

    pub fn kind_of(&self, raw: u64) -> Result<ObjectKind, BridgeError> {
        self.resolve_raw(raw).map(|(_, o)| o.kind())
    }

    pub fn owner_of(&self, hnd: Handle) -> Option<Owner> {
        self.entries.get(&hnd).map(|e| e.owner)
    }

    /// Remove a handle and run the object's close hook.
    pub fn release(&self, hnd: Handle) -> Result<(), BridgeError> {
        let (_, entry) = self
            .entries
            .remove(&hnd)
            .ok_or(BridgeError::InvalidHandle(hnd.get()))?;
        tracing::trace!(hnd = %hnd, kind = %entry.object.kind(), "Released handle");
        entry.object.close();
        Ok(())
    }

    /// Release every handle belonging to `owner`. Returns how many went away.
    pub fn release_all(&self, owner: Owner) -> usize {
        let doomed: Vec<Handle> = self
            .entries
            .iter()
            .filter(|e| e.owner == owner)
            .map(|e| *e.key())
            .collect();

        let mut released = 0;
        for hnd in doomed {
            // Close hooks run outside the shard lock.
            if let Some((_, entry)) = self.entries.remove(&hnd) {
                entry.object.close();
                released += 1;
            }
        }
        released
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_kind(&self, kind: ObjectKind) -> usize {
        self.entries
            .iter()
            .filter(|e| e.object.kind() == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::adapter::DeviceAdapter;

    fn device(id: &str) -> BridgedObject {
        BridgedObject::Device(Arc::new(DeviceAdapter::new(id)))
    }

    #[test]
    fn handles_start_at_one_and_never_repeat() {
        let table = HandleTable::new();
        let a = table.allocate(device("a"), Owner::Process);
        let b = table.allocate(device("b"), Owner::Process);
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 2);

        table.release(a).unwrap();
        let c = table.allocate(device("c"), Owner::Process);
        assert_eq!(c.get(), 3);
    }

    #[test]
    fn zero_and_out_of_range_are_invalid() {
        assert_eq!(Handle::from_raw(0), Err(BridgeError::InvalidHandle(0)));
        assert_eq!(
            Handle::from_raw(u64::MAX),
            Err(BridgeError::InvalidHandle(u64::MAX))
        );
        assert!(Handle::from_raw(Handle::MAX).is_ok());
    }

    #[test]
    fn unknown_and_released_handles_fail_to_resolve() {
        let table = HandleTable::new();
        assert!(matches!(
            table.require(42, Operation::Read),
            Err(BridgeError::InvalidHandle(42))
        ));

        let h = table.allocate(device("a"), Owner::Process);
        table.release(h).unwrap();
        assert!(matches!(
            table.resolve(h),
            Err(BridgeError::InvalidHandle(_))
        ));
        assert!(matches!(
            table.release(h),
            Err(BridgeError::InvalidHandle(_))
        ));
    }

    #[test]
    fn kind_mismatch_is_unsupported_not_invalid() {
        let table = HandleTable::new();
        let h = table.allocate(device("a"), Owner::Process);
        assert!(matches!(
            table.require(h.get(), Operation::Write),
            Err(BridgeError::UnsupportedOperation {
                kind: ObjectKind::Device,
                op: Operation::Write,
            })
        ));
        assert!(table.require(h.get(), Operation::Read).is_ok());
    }

    #[test]
    fn release_all_only_touches_one_owner() {
        let table = HandleTable::new();
        let a = Owner::Connection(ConnectionId::new());
        let b = Owner::Connection(ConnectionId::new());

        let a1 = table.allocate(device("a1"), a);
        let a2 = table.allocate(device("a2"), a);
        let b1 = table.allocate(device("b1"), b);
        let p1 = table.allocate(device("p1"), Owner::Process);

        assert_eq!(table.release_all(a), 2);
        assert!(table.resolve(a1).is_err());
        assert!(table.resolve(a2).is_err());
        assert!(table.resolve(b1).is_ok());
        assert!(table.resolve(p1).is_ok());
        assert_eq!(table.owner_of(b1), Some(b));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocation_is_injective() {
        let table = Arc::new(HandleTable::new());
        let mut tasks = Vec::new();
        for t in 0..8 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                (0..250)
                    .map(|i| table.allocate(device(&format!("{t}-{i}")), Owner::Process))
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for h in task.await.unwrap() {
                assert!(seen.insert(h), "handle {h} handed out twice");
            }
        }
        assert_eq!(seen.len(), 2000);
        assert_eq!(table.len(), 2000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn released_handles_stop_resolving_under_contention() {
        let table = Arc::new(HandleTable::new());
        let handles: Vec<Handle> = (0..500)
            .map(|i| table.allocate(device(&i.to_string()), Owner::Process))
            .collect();

        let releaser = {
            let table = table.clone();
            let handles = handles.clone();
            tokio::spawn(async move {
                for h in handles {
                    table.release(h).unwrap();
                    assert!(table.resolve(h).is_err());
                    tokio::task::yield_now().await;
                }
            })
        };
        let reader = {
            let table = table.clone();
            tokio::spawn(async move {
                for h in handles.iter().cycle().take(5000) {
                    let _ = table.resolve(*h);
                }
            })
        };

        releaser.await.unwrap();
        reader.await.unwrap();
        assert!(table.is_empty());
    }
}
