//! Putting cached resources where they are used.
//!
//! An unpacker takes a resource of type `T` and writes it into a destination of type `D`, such as
//! a component of an entity. Unpackers are registered per `(T, D)` pair and usually follow the
//! resource incrementally with [`crate::resource::aba::unpack_incrementally`].
use std::any::{Any, TypeId};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;

use crate::error::RuntimeError;
use crate::resource::loader::{GetResource, ResourceLoader};
use crate::resource::registry::ResourceRegistry;
use crate::resource::{Resource, ResourceEpoch, Uuid};
use crate::runtime::completion::CompletionContext;
use crate::runtime::job::Job;
use crate::runtime::local::LocalContext;
use crate::runtime::offscreen::OffscreenContext;
use crate::runtime::thread_pool::ThreadPool;
use crate::util::short_type_name;
use crate::util::task_counter::SingleTaskGuard;

type UnpackerFn<D> = Arc<dyn Fn(ResourceUnpackerContext, Uuid, D) -> Job<()> + Send + Sync>;

/// Dispatches "put resource `uuid` of type `T` into destination `D`" to the unpacker registered
/// for that pair of types.
pub struct ResourceUnpacker {
    loader: Arc<ResourceLoader>,
    dispatch_table: DashMap<(TypeId, TypeId), Box<dyn Any + Send + Sync>>,
    weak_self: Weak<ResourceUnpacker>,
}

impl ResourceUnpacker {
    pub fn new(loader: Arc<ResourceLoader>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            loader,
            dispatch_table: DashMap::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub fn resource_loader(&self) -> &Arc<ResourceLoader> {
        &self.loader
    }

    pub fn register_unpacker<T, D, F>(&self, unpacker: F) -> Result<(), RuntimeError>
    where
        T: Resource,
        D: Send + 'static,
        F: Fn(ResourceUnpackerContext, Uuid, D) -> Job<()> + Send + Sync + 'static,
    {
        match self
            .dispatch_table
            .entry((TypeId::of::<T>(), TypeId::of::<D>()))
        {
            Entry::Occupied(_) => Err(RuntimeError::UnpackerAlreadyRegistered {
                resource: short_type_name::<T>(),
                destination: short_type_name::<D>(),
            }),
            Entry::Vacant(vacant) => {
                let unpacker: UnpackerFn<D> = Arc::new(unpacker);
                vacant.insert(Box::new(unpacker));
                Ok(())
            }
        }
    }

    pub fn has_unpacker_for<T: Resource, D: 'static>(&self) -> bool {
        self.dispatch_table
            .contains_key(&(TypeId::of::<T>(), TypeId::of::<D>()))
    }

    /// Starts unpacking `uuid` into `destination`. The returned job completes once the unpacker is
    /// done or has bailed.
    pub fn unpack<T, D>(&self, uuid: Uuid, destination: D) -> Result<Job<()>, RuntimeError>
    where
        T: Resource,
        D: Send + 'static,
    {
        let unpacker = self
            .dispatch_table
            .get(&(TypeId::of::<T>(), TypeId::of::<D>()))
            .and_then(|unpacker| unpacker.value().downcast_ref::<UnpackerFn<D>>().cloned())
            .ok_or(RuntimeError::NoUnpacker {
                resource: short_type_name::<T>(),
                destination: short_type_name::<D>(),
            })?;

        let Some(this) = self.weak_self.upgrade() else {
            return Ok(Job::failed(anyhow::anyhow!("The resource unpacker is shutting down")));
        };

        debug!(
            "Unpacking {} {uuid} into {}",
            short_type_name::<T>(),
            short_type_name::<D>()
        );
        Ok(unpacker(ResourceUnpackerContext::new(this), uuid, destination))
    }
}

/// Handed to every unpacker call. Counts as a task in flight for as long as it is alive.
pub struct ResourceUnpackerContext {
    // Released before the unpacker, whose last reference may take the cradle down with it.
    _task_guard: SingleTaskGuard,
    unpacker: Arc<ResourceUnpacker>,
}

impl ResourceUnpackerContext {
    fn new(unpacker: Arc<ResourceUnpacker>) -> Self {
        let task_guard = unpacker
            .loader
            .cradle()
            .task_counter
            .obtain_task_guard();
        Self {
            unpacker,
            _task_guard: task_guard,
        }
    }

    /// Another context for a job spawned by this unpacker, counted separately.
    pub fn child_context(&self) -> Self {
        Self::new(self.unpacker.clone())
    }

    pub fn resource_unpacker(&self) -> &Arc<ResourceUnpacker> {
        &self.unpacker
    }

    pub fn resource_loader(&self) -> &Arc<ResourceLoader> {
        &self.unpacker.loader
    }

    pub fn resource_registry(&self) -> &Arc<ResourceRegistry> {
        self.unpacker.loader.resource_registry()
    }

    pub fn task_pool(&self) -> &Arc<ThreadPool> {
        &self.unpacker.loader.cradle().task_pool
    }

    pub fn offscreen_context(&self) -> &Arc<OffscreenContext> {
        &self.unpacker.loader.cradle().offscreen_context
    }

    pub fn completion_context(&self) -> &Arc<CompletionContext> {
        &self.unpacker.loader.cradle().completion_context
    }

    pub fn local_context(&self) -> &Arc<LocalContext> {
        &self.unpacker.loader.cradle().local_context
    }

    pub fn get_resource<'a, T: Resource>(&'a self, uuid: Uuid, epoch: Option<&'a mut ResourceEpoch>) -> GetResource<'a, T> {
        self.resource_loader().get_resource(uuid, epoch)
    }

    /// Unpacks a resource this one depends on into a destination of its own.
    pub fn unpack_dependency<T, D>(&self, uuid: Uuid, destination: D) -> Result<Job<()>, RuntimeError>
    where
        T: Resource,
        D: Send + 'static,
    {
        self.unpacker.unpack::<T, D>(uuid, destination)
    }
}
