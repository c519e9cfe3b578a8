//! Typed resources, identified by [`Uuid`] and versioned by [`ResourceEpoch`].
use std::any::TypeId;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub use uuid::Uuid;

use crate::util::short_type_name;

pub mod aba;
pub mod loader;
pub mod registry;
pub mod unpacker;

/// Anything that can be cached in the registry. Values are handed out by copy, so resources
/// that are expensive to copy should share their payload behind an `Arc`.
pub trait Resource: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Resource for T {}

/// Version of a cached resource. Grows with every published update.
pub type ResourceEpoch = u32;

/// The caller holds nothing yet.
pub const NULL_EPOCH: ResourceEpoch = 0;
/// The resource is complete and will never be updated again.
pub const FINAL_EPOCH: ResourceEpoch = u32::MAX;

/// Returned by producers after every update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceProgress {
    Incomplete,
    Complete,
}

/// Where a `(uuid, type)` pair currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Absent,
    Pending,
    Complete,
}

/// The identity of one cached resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceItem {
    pub uuid: Uuid,
    pub type_id: TypeId,
    pub type_name: &'static str,
}

impl ResourceItem {
    pub fn of<T: Resource>(uuid: Uuid) -> Self {
        Self {
            uuid,
            type_id: TypeId::of::<T>(),
            type_name: short_type_name::<T>(),
        }
    }
}

impl Debug for ResourceItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.type_name, self.uuid)
    }
}

/// A lease on a cached resource. The registry counts live leases per entry, which is what
/// eviction decisions are based on.
pub struct ResourceUsage {
    item: ResourceItem,
    refcount: Arc<AtomicUsize>,
}

impl ResourceUsage {
    pub(crate) fn new(item: ResourceItem, refcount: Arc<AtomicUsize>) -> Self {
        refcount.fetch_add(1, Ordering::AcqRel);
        Self { item, refcount }
    }

    pub fn item(&self) -> &ResourceItem {
        &self.item
    }

    pub fn uuid(&self) -> Uuid {
        self.item.uuid
    }
}

impl Clone for ResourceUsage {
    fn clone(&self) -> Self {
        Self::new(self.item, self.refcount.clone())
    }
}

impl Drop for ResourceUsage {
    fn drop(&mut self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Debug for ResourceUsage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceUsage")
            .field("item", &self.item)
            .finish()
    }
}

/// A copy of a cached resource together with the lease that keeps it counted.
#[derive(Clone, Debug)]
pub struct PublicResource<T> {
    pub resource: T,
    pub usage: ResourceUsage,
}
