//! Loading resources into the registry on demand.
//!
//! The first job that asks for a UUID that is neither cached nor pending starts the loader
//! registered for its type. Loaders publish the resource with
//! [`ResourceLoaderContext::create_resource`] as soon as something usable exists and refine it with
//! [`ResourceLoaderContext::update_resource`]; every publication resumes the jobs waiting in
//! [`ResourceLoader::get_resource`].
use std::any::TypeId;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, warn};

use crate::error::{JobError, RuntimeError};
use crate::resource::registry::{PendingWaiter, ResourceRegistry, Storage, next_epoch};
use crate::resource::{
    FINAL_EPOCH, NULL_EPOCH, PublicResource, Resource, ResourceEpoch, ResourceItem, ResourceProgress,
    ResourceUsage, Uuid,
};
use crate::runtime::completion::CompletionContext;
use crate::runtime::cradle::AsyncCradle;
use crate::runtime::job::Job;
use crate::runtime::local::LocalContext;
use crate::runtime::offscreen::OffscreenContext;
use crate::runtime::thread_pool::ThreadPool;
use crate::util::short_type_name;
use crate::util::task_counter::SingleTaskGuard;

type LoaderFn = Arc<dyn Fn(ResourceLoaderContext, Uuid) -> Job<()> + Send + Sync>;

pub struct ResourceLoader {
    registry: Arc<ResourceRegistry>,
    cradle: Arc<AsyncCradle>,
    dispatch_table: DashMap<TypeId, LoaderFn>,
    weak_self: Weak<ResourceLoader>,
}

impl ResourceLoader {
    pub fn new(registry: Arc<ResourceRegistry>, cradle: Arc<AsyncCradle>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            registry,
            cradle,
            dispatch_table: DashMap::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub fn resource_registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn cradle(&self) -> &Arc<AsyncCradle> {
        &self.cradle
    }

    /// Registers the loader of resources of type `T` and initializes their storage.
    ///
    /// The loader is called once per UUID that becomes pending and must eventually publish the
    /// final resource or fail it. Returning a failed job while the UUID is still pending fails
    /// every waiter.
    pub fn register_loader<T, F>(&self, loader: F) -> Result<(), RuntimeError>
    where
        T: Resource,
        F: Fn(ResourceLoaderContext, Uuid) -> Job<()> + Send + Sync + 'static,
    {
        self.registry.initialize_storage_for::<T>();
        match self.dispatch_table.entry(TypeId::of::<T>()) {
            Entry::Occupied(_) => Err(RuntimeError::LoaderAlreadyRegistered {
                type_name: short_type_name::<T>(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(loader));
                Ok(())
            }
        }
    }

    /// Resolves to a copy of the resource once it is available, starting the load if nobody has.
    ///
    /// With `Some(epoch)` the caller holds the version `*epoch` already (or [`NULL_EPOCH`] for
    /// none) and is resumed with the first newer one, `*epoch` is updated to the version handed
    /// out. Repeat until `*epoch` is [`FINAL_EPOCH`] to follow a load incrementally. With `None`
    /// only the final version is handed out.
    pub fn get_resource<'a, T: Resource>(&'a self, uuid: Uuid, epoch: Option<&'a mut ResourceEpoch>) -> GetResource<'a, T> {
        GetResource {
            loader: self,
            uuid,
            epoch,
            state: GetResourceState::Init,
        }
    }

    /// Loads the final version of a resource as an independent job.
    pub fn load<T: Resource>(&self, uuid: Uuid) -> Job<PublicResource<T>> {
        let Some(this) = self.weak_self.upgrade() else {
            return Job::failed(anyhow::anyhow!("The resource loader is shutting down"));
        };
        Job::new(async move { Ok(this.get_resource::<T>(uuid, None).await?) })
    }

    fn start_loading<T: Resource>(&self, uuid: Uuid) {
        let item = ResourceItem::of::<T>(uuid);
        let loader = self
            .dispatch_table
            .get(&TypeId::of::<T>())
            .map(|loader| loader.value().clone());

        let Some(loader) = loader else {
            warn!("No loader for {item:?}");
            self.fail_pending::<T>(uuid, RuntimeError::NoLoader { type_name: item.type_name }.into());
            return;
        };
        let Some(this) = self.weak_self.upgrade() else {
            self.fail_pending::<T>(uuid, anyhow::anyhow!("The resource loader is shutting down").into());
            return;
        };

        debug!("Loading {item:?}");
        let job = loader(ResourceLoaderContext::new(this.clone()), uuid);
        let _watcher = Job::new(async move {
            if let Err(error) = job.await {
                warn!("Loading {item:?} failed: {error}");
                this.fail_pending::<T>(uuid, error);
            }
            Ok(())
        });
    }

    /// Fails every waiter of `uuid` and drops the partial resource, if it is still pending.
    fn fail_pending<T: Resource>(&self, uuid: Uuid, error: JobError) -> bool {
        let Ok(storage) = self.registry.storage::<T>() else {
            return false;
        };
        if !storage.is_pending(uuid) {
            return false;
        }

        {
            let mut map = storage.lock_map_exclusive();
            let partial = map
                .lock_entry_shared(uuid)
                .is_some_and(|entry| entry.epoch() != FINAL_EPOCH);
            if partial {
                let _ = map.erase(uuid);
            }
        }

        storage.resolve_pending(uuid, FINAL_EPOCH, Err(error));
        true
    }
}

enum GetResourceState<T> {
    Init,
    Waiting {
        storage: Arc<Storage<T>>,
        waiter: Arc<PendingWaiter>,
    },
    Done,
}

/// Future returned by [`ResourceLoader::get_resource`].
pub struct GetResource<'a, T> {
    loader: &'a ResourceLoader,
    uuid: Uuid,
    epoch: Option<&'a mut ResourceEpoch>,
    state: GetResourceState<T>,
}

impl<T: Resource> GetResource<'_, T> {
    fn only_final(&self) -> bool {
        self.epoch.is_none()
    }

    fn current_epoch(&self) -> ResourceEpoch {
        self.epoch
            .as_deref()
            .copied()
            .unwrap_or(NULL_EPOCH)
    }

    fn caller_wants(&self, epoch: ResourceEpoch) -> bool {
        if self.only_final() {
            epoch == FINAL_EPOCH
        } else {
            epoch > self.current_epoch()
        }
    }

    fn try_take(&mut self, storage: &Storage<T>) -> Option<PublicResource<T>> {
        let map = storage.lock_map_shared();
        let entry = map.lock_entry_shared(self.uuid)?;
        let epoch = entry.epoch();
        if !self.caller_wants(epoch) {
            return None;
        }

        if let Some(caller_epoch) = self.epoch.as_deref_mut() {
            *caller_epoch = epoch;
        }
        Some(entry.obtain_public())
    }

    fn take_or_wait(&mut self, storage: Arc<Storage<T>>, cx: &mut Context<'_>) -> Poll<Result<PublicResource<T>, JobError>> {
        if let Some(public) = self.try_take(&storage) {
            return Poll::Ready(Ok(public));
        }

        let waiter = PendingWaiter::new(cx.waker().clone());
        let was_emplaced = {
            let mut pending = storage.lock_pending();
            // Producers publish before they take the pending lock, look again while holding it.
            if let Some(public) = self.try_take(&storage) {
                return Poll::Ready(Ok(public));
            }
            pending.register(self.uuid, waiter.clone(), self.only_final())
        };

        // Loaders may publish synchronously, which takes the pending lock again.
        if was_emplaced {
            self.loader.start_loading::<T>(self.uuid);
        }

        self.state = GetResourceState::Waiting { storage, waiter };
        Poll::Pending
    }
}

impl<T: Resource> Future for GetResource<'_, T> {
    type Output = Result<PublicResource<T>, JobError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, GetResourceState::Done) {
            GetResourceState::Init => {
                if this.current_epoch() == FINAL_EPOCH {
                    return Poll::Ready(Err(RuntimeError::AlreadyFinal {
                        type_name: short_type_name::<T>(),
                        uuid: this.uuid,
                    }
                    .into()));
                }

                match this.loader.registry.storage::<T>() {
                    Ok(storage) => this.take_or_wait(storage, cx),
                    Err(error) => Poll::Ready(Err(error.into())),
                }
            }
            GetResourceState::Waiting { storage, waiter } => match waiter.poll_resolved(cx) {
                Poll::Pending => {
                    this.state = GetResourceState::Waiting { storage, waiter };
                    Poll::Pending
                }
                Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
                // Usually wanted, unless the entry was dropped and recreated meanwhile.
                Poll::Ready(Ok(())) => this.take_or_wait(storage, cx),
            },
            GetResourceState::Done => panic!("Polled a completed get_resource"),
        }
    }
}

/// Handed to every loader call. Counts as a task in flight for as long as it is alive.
pub struct ResourceLoaderContext {
    // Released before the loader, whose last reference may take the cradle down with it.
    _task_guard: SingleTaskGuard,
    loader: Arc<ResourceLoader>,
}

impl ResourceLoaderContext {
    fn new(loader: Arc<ResourceLoader>) -> Self {
        let task_guard = loader.cradle.task_counter.obtain_task_guard();
        Self {
            loader,
            _task_guard: task_guard,
        }
    }

    pub fn resource_loader(&self) -> &Arc<ResourceLoader> {
        &self.loader
    }

    pub fn resource_registry(&self) -> &Arc<ResourceRegistry> {
        &self.loader.registry
    }

    /// The pool loaders are supposed to do their decoding on.
    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        &self.loader.cradle.loading_pool
    }

    pub fn task_pool(&self) -> &Arc<ThreadPool> {
        &self.loader.cradle.task_pool
    }

    pub fn offscreen_context(&self) -> &Arc<OffscreenContext> {
        &self.loader.cradle.offscreen_context
    }

    pub fn completion_context(&self) -> &Arc<CompletionContext> {
        &self.loader.cradle.completion_context
    }

    pub fn local_context(&self) -> &Arc<LocalContext> {
        &self.loader.cradle.local_context
    }

    /// Waits for another resource this one depends on.
    pub fn get_resource_dependency<'a, T: Resource>(
        &'a self,
        uuid: Uuid,
        epoch: Option<&'a mut ResourceEpoch>,
    ) -> GetResource<'a, T> {
        self.loader.get_resource(uuid, epoch)
    }

    /// Publishes the first version of a resource, at epoch 1 or directly as final.
    pub fn create_resource<T: Resource>(
        &self,
        uuid: Uuid,
        progress: ResourceProgress,
        resource: T,
    ) -> Result<ResourceUsage, RuntimeError> {
        let storage = self.resource_registry().storage::<T>()?;
        let epoch = match progress {
            ResourceProgress::Complete => FINAL_EPOCH,
            ResourceProgress::Incomplete => NULL_EPOCH + 1,
        };

        let usage = {
            let mut map = storage.lock_map_exclusive();
            let entry = map
                .new_entry(uuid, resource, epoch)
                .ok_or(RuntimeError::AlreadyCached {
                    type_name: short_type_name::<T>(),
                    uuid,
                })?;
            entry.obtain_usage()
        };

        storage.resolve_pending(uuid, epoch, Ok(()));
        Ok(usage)
    }

    /// Mutates a published resource in place and publishes the result as a new version. Returns
    /// the new epoch.
    pub fn update_resource<T, F>(&self, uuid: Uuid, update: F) -> Result<ResourceEpoch, RuntimeError>
    where
        T: Resource,
        F: FnOnce(&mut T) -> ResourceProgress,
    {
        let storage = self.resource_registry().storage::<T>()?;
        let epoch = {
            let map = storage.lock_map_shared();
            let mut entry = map
                .lock_entry_exclusive(uuid)
                .ok_or(RuntimeError::NotCached {
                    type_name: short_type_name::<T>(),
                    uuid,
                })?;

            if entry.epoch() == FINAL_EPOCH {
                return Err(RuntimeError::AlreadyFinal {
                    type_name: short_type_name::<T>(),
                    uuid,
                });
            }

            let epoch = match update(entry.resource_mut()) {
                ResourceProgress::Complete => FINAL_EPOCH,
                ResourceProgress::Incomplete => next_epoch(entry.epoch()),
            };
            entry.set_epoch(epoch);
            epoch
        };

        storage.resolve_pending(uuid, epoch, Ok(()));
        Ok(epoch)
    }

    /// Fails every job waiting for `uuid` and drops whatever partial version was published, so
    /// that a later request starts over.
    pub fn fail_resource<T: Resource>(&self, uuid: Uuid, error: impl Into<JobError>) -> Result<(), RuntimeError> {
        if self.loader.fail_pending::<T>(uuid, error.into()) {
            Ok(())
        } else {
            self.resource_registry().storage::<T>()?;
            Err(RuntimeError::NotPending {
                type_name: short_type_name::<T>(),
                uuid,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cradle::CradleConfig;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    struct Shader(String);

    fn loader() -> Arc<ResourceLoader> {
        let cradle = AsyncCradle::new(&CradleConfig {
            task_pool_size: 1,
            loading_pool_size: 1,
            sleep_budget: Duration::from_micros(50),
        })
        .unwrap();
        ResourceLoader::new(Arc::new(ResourceRegistry::new()), Arc::new(cradle))
    }

    #[test]
    pub fn synchronous_loader_completes_inline() {
        let loader = loader();
        loader
            .register_loader::<Shader, _>(|context, uuid| {
                Job::new(async move {
                    context.create_resource(uuid, ResourceProgress::Complete, Shader("void main() {}".into()))?;
                    Ok(())
                })
            })
            .unwrap();

        let job = loader.load::<Shader>(Uuid::new_v4());
        assert!(job.is_ready());
        let public = job.extract_result().unwrap();
        assert_eq!(public.resource, Shader("void main() {}".into()));
    }

    #[test]
    pub fn loader_is_registered_once() {
        let loader = loader();
        let noop = |_context: ResourceLoaderContext, _uuid: Uuid| Job::ready(());
        assert!(loader.register_loader::<Shader, _>(noop).is_ok());
        assert!(matches!(
            loader.register_loader::<Shader, _>(noop),
            Err(RuntimeError::LoaderAlreadyRegistered { .. })
        ));
    }

    #[test]
    pub fn missing_loader_fails_the_request() {
        let loader = loader();
        loader
            .resource_registry()
            .initialize_storage_for::<Shader>();
        let job = loader.load::<Shader>(Uuid::new_v4());
        assert!(job.is_ready());
        assert!(job.extract_result().is_err());
    }

    #[test]
    pub fn failing_loader_fails_waiters_and_allows_a_retry() {
        let loader = loader();
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        loader
            .register_loader::<Shader, _>({
                let attempts = attempts.clone();
                move |context, uuid| {
                    let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Job::new(async move {
                        if attempt == 0 {
                            context.create_resource(uuid, ResourceProgress::Incomplete, Shader(String::new()))?;
                            anyhow::bail!("syntax error");
                        }
                        context.create_resource(uuid, ResourceProgress::Complete, Shader("ok".into()))?;
                        Ok(())
                    })
                }
            })
            .unwrap();

        let uuid = Uuid::new_v4();
        assert!(loader.load::<Shader>(uuid).wait().is_err());
        assert_eq!(
            loader
                .resource_registry()
                .state_of::<Shader>(uuid)
                .unwrap(),
            crate::resource::ResourceState::Absent
        );
        assert_eq!(
            loader.load::<Shader>(uuid).wait().unwrap().resource,
            Shader("ok".into())
        );
    }
}
