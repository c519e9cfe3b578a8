//! The typed, epoch-versioned resource cache.
//!
//! There is one [`Storage`] per resource type. A storage maps UUIDs to entries and keeps, per
//! UUID that is being loaded, the lists of jobs waiting for the next update of it.
//!
//! Three kinds of locks are involved, always taken in this order:
//! 1. the pending lists lock of the storage,
//! 2. the map lock (exclusive only to insert or erase entries),
//! 3. the entry lock, one of a fixed pool of locks shared by all entries of the storage.
//!
//! The guards returned by the map locks are the only way to reach an entry and the entry guards
//! are the only way to reach its value, so holding the right lock is checked by the compiler. At
//! most one entry lock may be held at a time, entries share the pooled locks.
use std::any::{Any, TypeId};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll, Waker};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as StorageSlot;
use log::{debug, trace, warn};
use smallvec::SmallVec;

use crate::error::{JobError, RuntimeError};
use crate::resource::{
    FINAL_EPOCH, PublicResource, Resource, ResourceEpoch, ResourceItem, ResourceState, ResourceUsage, Uuid,
};
use crate::util::mutex_pool::MutexPool;
use crate::util::short_type_name;

pub const ENTRY_MUTEX_POOL_SIZE: usize = 32;

struct EntryCell<T> {
    epoch: ResourceEpoch,
    resource: T,
}

/// One cached resource. Only reachable through the guards of the storage it lives in.
pub struct StorageEntry<T> {
    refcount: Arc<AtomicUsize>,
    mutex_slot: u32,
    cell: UnsafeCell<EntryCell<T>>,
}

// The cell is only ever accessed through EntryReadGuard/EntryWriteGuard, which hold the pooled
// lock of `mutex_slot` at the matching strength.
unsafe impl<T: Send> Send for StorageEntry<T> {}
unsafe impl<T: Send + Sync> Sync for StorageEntry<T> {}

impl<T> StorageEntry<T> {
    pub fn usage_count(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }
}

enum WaiterState {
    Waiting(Waker),
    Resolved(Result<(), JobError>),
    Taken,
}

/// A job suspended in `get_resource`, waiting for the next update of one UUID.
pub(crate) struct PendingWaiter {
    state: Mutex<WaiterState>,
}

impl PendingWaiter {
    pub(crate) fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WaiterState::Waiting(waker)),
        })
    }

    fn resolve(&self, outcome: Result<(), JobError>) {
        let waker = {
            let mut state = self.state.lock().expect("Pending Waiter Lock");
            match std::mem::replace(&mut *state, WaiterState::Resolved(outcome)) {
                WaiterState::Waiting(waker) => waker,
                WaiterState::Resolved(_) | WaiterState::Taken => unreachable!("A pending waiter was resolved twice"),
            }
        };
        waker.wake();
    }

    pub(crate) fn poll_resolved(&self, cx: &mut Context<'_>) -> Poll<Result<(), JobError>> {
        let mut state = self.state.lock().expect("Pending Waiter Lock");
        if let WaiterState::Waiting(waker) = &mut *state {
            if !waker.will_wake(cx.waker()) {
                *waker = cx.waker().clone();
            }
            return Poll::Pending;
        }

        match std::mem::replace(&mut *state, WaiterState::Taken) {
            WaiterState::Resolved(outcome) => Poll::Ready(outcome),
            _ => unreachable!("Polled a resolved pending waiter again"),
        }
    }
}

type WaiterList = SmallVec<[Arc<PendingWaiter>; 4]>;

/// Present for every UUID that is being loaded, even when nobody waits.
#[derive(Default)]
struct PendingLists {
    incremental: WaiterList,
    only_final: WaiterList,
}

/// Proof that the pending lists of a storage are locked.
pub(crate) struct PendingGuard<'s> {
    lists: MutexGuard<'s, HashMap<Uuid, PendingLists>>,
}

impl PendingGuard<'_> {
    /// Adds `waiter` to the lists of `uuid`. Returns `true` if the UUID was not pending before,
    /// in which case the caller is responsible for starting the load.
    pub(crate) fn register(&mut self, uuid: Uuid, waiter: Arc<PendingWaiter>, only_final: bool) -> bool {
        let (lists, was_emplaced) = match self.lists.entry(uuid) {
            Entry::Occupied(occupied) => (occupied.into_mut(), false),
            Entry::Vacant(vacant) => (vacant.insert(PendingLists::default()), true),
        };

        if only_final {
            lists.only_final.push(waiter);
        } else {
            lists.incremental.push(waiter);
        }
        was_emplaced
    }
}

pub struct Storage<T> {
    map: RwLock<HashMap<Uuid, StorageEntry<T>>>,
    entry_mutex_pool: MutexPool,
    pending: Mutex<HashMap<Uuid, PendingLists>>,
}

impl<T: Resource> Storage<T> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            entry_mutex_pool: MutexPool::new(ENTRY_MUTEX_POOL_SIZE),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_map_shared(&self) -> MapReadGuard<'_, T> {
        MapReadGuard {
            storage: self,
            map: self.map.read().expect("Storage Map Lock"),
        }
    }

    pub fn lock_map_exclusive(&self) -> MapWriteGuard<'_, T> {
        MapWriteGuard {
            storage: self,
            map: self.map.write().expect("Storage Map Lock"),
        }
    }

    pub(crate) fn lock_pending(&self) -> PendingGuard<'_> {
        PendingGuard {
            lists: self.pending.lock().expect("Storage Pending Lock"),
        }
    }

    pub fn is_pending(&self, uuid: Uuid) -> bool {
        self.lock_pending().lists.contains_key(&uuid)
    }

    pub fn state_of(&self, uuid: Uuid) -> ResourceState {
        let pending = self.lock_pending();
        if pending.lists.contains_key(&uuid) {
            ResourceState::Pending
        } else if self.lock_map_shared().contains(uuid) {
            ResourceState::Complete
        } else {
            ResourceState::Absent
        }
    }

    /// A copy of whatever is cached right now, partial or not, without waiting or loading.
    pub fn try_get(&self, uuid: Uuid) -> Option<(PublicResource<T>, ResourceEpoch)> {
        let map = self.lock_map_shared();
        let entry = map.lock_entry_shared(uuid)?;
        Some((entry.obtain_public(), entry.epoch()))
    }

    /// The number of live [`ResourceUsage`] leases of a cached resource.
    pub fn usage_count(&self, uuid: Uuid) -> Option<usize> {
        self.lock_map_shared()
            .get(uuid)
            .map(StorageEntry::usage_count)
    }

    /// Hands the outcome of an update of `uuid` to the jobs waiting for it.
    ///
    /// Incremental waiters are resumed by every update, final-only waiters only once `epoch` is
    /// final or the load failed, in which case the UUID stops being pending. Waiters are resumed
    /// after every lock has been released. Returns the number of resumed waiters.
    pub(crate) fn resolve_pending(&self, uuid: Uuid, epoch: ResourceEpoch, outcome: Result<(), JobError>) -> usize {
        let resolves_for_good = epoch == FINAL_EPOCH || outcome.is_err();
        let (incremental, only_final) = {
            let mut pending = self.lock_pending();
            match pending.lists.entry(uuid) {
                Entry::Occupied(mut occupied) => {
                    let incremental = std::mem::take(&mut occupied.get_mut().incremental);
                    let only_final = if resolves_for_good {
                        std::mem::take(&mut occupied.get_mut().only_final)
                    } else {
                        WaiterList::new()
                    };
                    if resolves_for_good {
                        occupied.remove();
                    }
                    (incremental, only_final)
                }
                Entry::Vacant(vacant) => {
                    // Published without a request, the producer keeps this one pending itself.
                    if !resolves_for_good {
                        vacant.insert(PendingLists::default());
                    }
                    (WaiterList::new(), WaiterList::new())
                }
            }
        };

        let num_resumed = incremental.len() + only_final.len();
        trace!(
            "Resolving {} {uuid} at epoch {epoch}: {} incremental, {} final-only waiters",
            short_type_name::<T>(),
            incremental.len(),
            only_final.len()
        );

        for waiter in incremental.into_iter().chain(only_final) {
            waiter.resolve(outcome.clone());
        }
        num_resumed
    }
}

/// Shared access to the map of a storage.
pub struct MapReadGuard<'s, T> {
    storage: &'s Storage<T>,
    map: RwLockReadGuard<'s, HashMap<Uuid, StorageEntry<T>>>,
}

/// Exclusive access to the map of a storage, required to insert and erase entries.
pub struct MapWriteGuard<'s, T> {
    storage: &'s Storage<T>,
    map: RwLockWriteGuard<'s, HashMap<Uuid, StorageEntry<T>>>,
}

fn lock_entry_shared<'g, T>(
    storage: &'g Storage<T>,
    map: &'g HashMap<Uuid, StorageEntry<T>>,
    uuid: Uuid,
) -> Option<EntryReadGuard<'g, T>> {
    let entry = map.get(&uuid)?;
    let lock = storage
        .entry_mutex_pool
        .get(entry.mutex_slot)
        .read()
        .expect("Storage Entry Lock");
    Some(EntryReadGuard {
        uuid,
        entry,
        _lock: lock,
    })
}

fn lock_entry_exclusive<'g, T>(
    storage: &'g Storage<T>,
    map: &'g HashMap<Uuid, StorageEntry<T>>,
    uuid: Uuid,
) -> Option<EntryWriteGuard<'g, T>> {
    let entry = map.get(&uuid)?;
    let lock = storage
        .entry_mutex_pool
        .get(entry.mutex_slot)
        .write()
        .expect("Storage Entry Lock");
    Some(EntryWriteGuard {
        uuid,
        entry,
        _lock: lock,
    })
}

impl<T: Resource> MapReadGuard<'_, T> {
    pub fn contains(&self, uuid: Uuid) -> bool {
        self.map.contains_key(&uuid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, uuid: Uuid) -> Option<&StorageEntry<T>> {
        self.map.get(&uuid)
    }

    pub fn lock_entry_shared(&self, uuid: Uuid) -> Option<EntryReadGuard<'_, T>> {
        lock_entry_shared(self.storage, &self.map, uuid)
    }

    pub fn lock_entry_exclusive(&self, uuid: Uuid) -> Option<EntryWriteGuard<'_, T>> {
        lock_entry_exclusive(self.storage, &self.map, uuid)
    }
}

impl<T: Resource> MapWriteGuard<'_, T> {
    pub fn contains(&self, uuid: Uuid) -> bool {
        self.map.contains_key(&uuid)
    }

    /// Inserts a new entry unless `uuid` is cached already, in which case somebody else got there
    /// first and `None` is returned. The returned guard reads the freshly inserted entry.
    pub fn new_entry(&mut self, uuid: Uuid, resource: T, epoch: ResourceEpoch) -> Option<EntryReadGuard<'_, T>> {
        let storage = self.storage;
        match self.map.entry(uuid) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(vacant) => {
                vacant.insert(StorageEntry {
                    refcount: Arc::new(AtomicUsize::new(0)),
                    mutex_slot: storage.entry_mutex_pool.new_mutex_slot(),
                    cell: UnsafeCell::new(EntryCell { epoch, resource }),
                });
            }
        }
        debug!("New {} entry {uuid} at epoch {epoch}", short_type_name::<T>());
        lock_entry_shared(storage, &self.map, uuid)
    }

    /// Removes an entry. Outstanding usages stay valid, they just stop being counted anywhere.
    pub fn erase(&mut self, uuid: Uuid) -> Option<T> {
        self.map
            .remove(&uuid)
            .map(|entry| entry.cell.into_inner().resource)
    }

    pub fn lock_entry_shared(&self, uuid: Uuid) -> Option<EntryReadGuard<'_, T>> {
        lock_entry_shared(self.storage, &self.map, uuid)
    }

    pub fn lock_entry_exclusive(&self, uuid: Uuid) -> Option<EntryWriteGuard<'_, T>> {
        lock_entry_exclusive(self.storage, &self.map, uuid)
    }
}

/// Shared access to one entry.
pub struct EntryReadGuard<'g, T> {
    uuid: Uuid,
    entry: &'g StorageEntry<T>,
    _lock: RwLockReadGuard<'g, ()>,
}

impl<T: Resource> EntryReadGuard<'_, T> {
    fn cell(&self) -> &EntryCell<T> {
        // SAFETY: the shared lock of the entry's pooled mutex is held.
        unsafe { &*self.entry.cell.get() }
    }

    pub fn epoch(&self) -> ResourceEpoch {
        self.cell().epoch
    }

    pub fn resource(&self) -> &T {
        &self.cell().resource
    }

    pub fn obtain_usage(&self) -> ResourceUsage {
        ResourceUsage::new(ResourceItem::of::<T>(self.uuid), self.entry.refcount.clone())
    }

    pub fn obtain_public(&self) -> PublicResource<T> {
        PublicResource {
            resource: self.resource().clone(),
            usage: self.obtain_usage(),
        }
    }
}

/// Exclusive access to one entry, required to mutate its value or epoch.
pub struct EntryWriteGuard<'g, T> {
    uuid: Uuid,
    entry: &'g StorageEntry<T>,
    _lock: RwLockWriteGuard<'g, ()>,
}

impl<T: Resource> EntryWriteGuard<'_, T> {
    fn cell(&self) -> &EntryCell<T> {
        // SAFETY: the exclusive lock of the entry's pooled mutex is held.
        unsafe { &*self.entry.cell.get() }
    }

    fn cell_mut(&mut self) -> &mut EntryCell<T> {
        // SAFETY: the exclusive lock of the entry's pooled mutex is held and `self` is borrowed
        // mutably, so this is the only reference into the cell.
        unsafe { &mut *self.entry.cell.get() }
    }

    pub fn epoch(&self) -> ResourceEpoch {
        self.cell().epoch
    }

    pub fn set_epoch(&mut self, epoch: ResourceEpoch) {
        self.cell_mut().epoch = epoch;
    }

    pub fn resource(&self) -> &T {
        &self.cell().resource
    }

    pub fn resource_mut(&mut self) -> &mut T {
        &mut self.cell_mut().resource
    }

    pub fn obtain_public(&self) -> PublicResource<T> {
        PublicResource {
            resource: self.resource().clone(),
            usage: ResourceUsage::new(ResourceItem::of::<T>(self.uuid), self.entry.refcount.clone()),
        }
    }
}

/// The epoch after `current`, for a non-final update. Never reaches [`FINAL_EPOCH`].
pub fn next_epoch(current: ResourceEpoch) -> ResourceEpoch {
    if current >= FINAL_EPOCH - 1 {
        warn!("Resource epoch overflow, updates stop being visible to incremental consumers");
        FINAL_EPOCH - 1
    } else {
        current + 1
    }
}

/// One [`Storage`] per resource type.
pub struct ResourceRegistry {
    storages: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            storages: DashMap::new(),
        }
    }

    /// Returns `true` if the storage was created by this call.
    pub fn initialize_storage_for<T: Resource>(&self) -> bool {
        match self.storages.entry(TypeId::of::<T>()) {
            StorageSlot::Occupied(_) => false,
            StorageSlot::Vacant(vacant) => {
                vacant.insert(Arc::new(Storage::<T>::new()));
                debug!("Initialized storage for {}", short_type_name::<T>());
                true
            }
        }
    }

    pub fn has_storage_for<T: Resource>(&self) -> bool {
        self.storages.contains_key(&TypeId::of::<T>())
    }

    pub fn num_storages(&self) -> usize {
        self.storages.len()
    }

    pub fn storage<T: Resource>(&self) -> Result<Arc<Storage<T>>, RuntimeError> {
        let storage = self
            .storages
            .get(&TypeId::of::<T>())
            .map(|storage| storage.value().clone())
            .ok_or(RuntimeError::StorageNotInitialized {
                type_name: short_type_name::<T>(),
            })?;

        match storage.downcast::<Storage<T>>() {
            Ok(storage) => Ok(storage),
            Err(_) => unreachable!("Storage registered under the type id of another type"),
        }
    }

    pub fn state_of<T: Resource>(&self, uuid: Uuid) -> Result<ResourceState, RuntimeError> {
        Ok(self.storage::<T>()?.state_of(uuid))
    }

    pub fn try_get<T: Resource>(&self, uuid: Uuid) -> Result<Option<(PublicResource<T>, ResourceEpoch)>, RuntimeError> {
        Ok(self.storage::<T>()?.try_get(uuid))
    }

    pub fn usage_count<T: Resource>(&self, uuid: Uuid) -> Result<Option<usize>, RuntimeError> {
        Ok(self.storage::<T>()?.usage_count(uuid))
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{NULL_EPOCH, ResourceState};

    #[derive(Clone, Debug, PartialEq)]
    struct Heightmap(Vec<u16>);

    #[test]
    pub fn storage_is_initialized_once() {
        let registry = ResourceRegistry::new();
        assert!(registry.initialize_storage_for::<Heightmap>());
        assert!(!registry.initialize_storage_for::<Heightmap>());
        assert_eq!(registry.num_storages(), 1);
        assert!(registry.has_storage_for::<Heightmap>());
        assert!(!registry.has_storage_for::<u32>());
    }

    #[test]
    pub fn missing_storage_is_reported() {
        let registry = ResourceRegistry::new();
        assert_eq!(
            registry.storage::<Heightmap>().err(),
            Some(RuntimeError::StorageNotInitialized { type_name: "Heightmap" })
        );
    }

    #[test]
    pub fn second_new_entry_loses() {
        let registry = ResourceRegistry::new();
        registry.initialize_storage_for::<Heightmap>();
        let storage = registry.storage::<Heightmap>().unwrap();
        let uuid = Uuid::new_v4();

        let mut map = storage.lock_map_exclusive();
        let usage = map
            .new_entry(uuid, Heightmap(vec![1]), 1)
            .map(|entry| entry.obtain_usage());
        assert!(usage.is_some());
        assert!(map.new_entry(uuid, Heightmap(vec![2]), 1).is_none());
        drop(map);

        let (public, epoch) = storage.try_get(uuid).unwrap();
        assert_eq!(public.resource, Heightmap(vec![1]));
        assert_eq!(epoch, 1);
        assert_eq!(storage.usage_count(uuid), Some(2));
        drop(public);
        drop(usage);
        assert_eq!(storage.usage_count(uuid), Some(0));
    }

    #[test]
    pub fn mutation_through_the_exclusive_guard() {
        let registry = ResourceRegistry::new();
        registry.initialize_storage_for::<Heightmap>();
        let storage = registry.storage::<Heightmap>().unwrap();
        let uuid = Uuid::new_v4();

        let _ = storage
            .lock_map_exclusive()
            .new_entry(uuid, Heightmap(vec![]), NULL_EPOCH + 1)
            .is_some();

        {
            let map = storage.lock_map_shared();
            let mut entry = map.lock_entry_exclusive(uuid).unwrap();
            entry.resource_mut().0.push(7);
            let next = next_epoch(entry.epoch());
            entry.set_epoch(next);
        }

        let map = storage.lock_map_shared();
        let entry = map.lock_entry_shared(uuid).unwrap();
        assert_eq!(entry.epoch(), 2);
        assert_eq!(entry.resource(), &Heightmap(vec![7]));
    }

    #[test]
    pub fn epochs_saturate_below_final() {
        assert_eq!(next_epoch(1), 2);
        assert_eq!(next_epoch(FINAL_EPOCH - 1), FINAL_EPOCH - 1);
    }

    #[test]
    pub fn states_follow_the_pending_lists() {
        let registry = ResourceRegistry::new();
        registry.initialize_storage_for::<Heightmap>();
        let storage = registry.storage::<Heightmap>().unwrap();
        let uuid = Uuid::new_v4();
        assert_eq!(storage.state_of(uuid), ResourceState::Absent);

        let waiter = PendingWaiter::new(Waker::noop().clone());
        assert!(storage.lock_pending().register(uuid, waiter.clone(), false));
        assert!(!storage.lock_pending().register(uuid, PendingWaiter::new(Waker::noop().clone()), true));
        assert_eq!(storage.state_of(uuid), ResourceState::Pending);

        let _ = storage
            .lock_map_exclusive()
            .new_entry(uuid, Heightmap(vec![]), 1)
            .is_some();
        assert_eq!(storage.resolve_pending(uuid, 1, Ok(())), 1);
        assert_eq!(storage.state_of(uuid), ResourceState::Pending);

        assert_eq!(storage.resolve_pending(uuid, FINAL_EPOCH, Ok(())), 1);
        assert_eq!(storage.state_of(uuid), ResourceState::Complete);

        let mut cx = Context::from_waker(Waker::noop());
        assert!(matches!(waiter.poll_resolved(&mut cx), Poll::Ready(Ok(()))));
    }
}
