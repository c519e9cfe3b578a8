use async_cradle::error::{JobError, RuntimeError};
use async_cradle::resource::loader::{ResourceLoader, ResourceLoaderContext};
use async_cradle::resource::registry::ResourceRegistry;
use async_cradle::resource::{FINAL_EPOCH, NULL_EPOCH, ResourceProgress, ResourceState, Uuid};
use async_cradle::runtime::cradle::{AsyncCradle, CradleConfig};
use async_cradle::runtime::job::Job;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use test_log::test;

#[derive(Clone, Debug, PartialEq)]
struct Heightmap(u32);

fn cradle() -> Arc<AsyncCradle> {
    Arc::new(
        AsyncCradle::new(&CradleConfig {
            task_pool_size: 2,
            loading_pool_size: 2,
            sleep_budget: Duration::from_micros(50),
        })
        .unwrap(),
    )
}

/// A loader that does nothing but hand its context to the test, which then publishes by hand.
fn manual_loader() -> (Arc<ResourceLoader>, Receiver<ResourceLoaderContext>) {
    let loader = ResourceLoader::new(Arc::new(ResourceRegistry::new()), cradle());
    let (sender, receiver) = channel();
    loader
        .register_loader::<Heightmap, _>(move |context, _uuid| {
            let _ = sender.send(context);
            Job::ready(())
        })
        .unwrap();
    (loader, receiver)
}

fn follow_incrementally(loader: &Arc<ResourceLoader>, uuid: Uuid) -> Job<Vec<u32>> {
    let loader = loader.clone();
    Job::new(async move {
        let mut epoch = NULL_EPOCH;
        let mut seen = vec![];
        while epoch != FINAL_EPOCH {
            let public = loader
                .get_resource::<Heightmap>(uuid, Some(&mut epoch))
                .await?;
            seen.push(public.resource.0);
        }
        Ok(seen)
    })
}

#[test]
fn exactly_one_concurrent_new_entry_wins() {
    let registry = Arc::new(ResourceRegistry::new());
    registry.initialize_storage_for::<Heightmap>();
    let uuid = Uuid::new_v4();
    let barrier = Arc::new(Barrier::new(8));
    let winners = Arc::new(AtomicUsize::new(0));

    let threads = (0..8)
        .map(|index| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            std::thread::spawn(move || {
                let storage = registry.storage::<Heightmap>().unwrap();
                barrier.wait();
                let mut map = storage.lock_map_exclusive();
                if map.new_entry(uuid, Heightmap(index), FINAL_EPOCH).is_some() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect::<Vec<_>>();

    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(
        registry.state_of::<Heightmap>(uuid).unwrap(),
        ResourceState::Complete
    );
}

#[test]
fn incremental_consumers_see_every_version_final_consumers_only_the_last() {
    let (loader, contexts) = manual_loader();
    let uuid = Uuid::new_v4();

    let incremental = follow_incrementally(&loader, uuid);
    let only_final = loader.load::<Heightmap>(uuid);
    let context = contexts.recv().unwrap();
    assert_eq!(
        loader
            .resource_registry()
            .state_of::<Heightmap>(uuid)
            .unwrap(),
        ResourceState::Pending
    );

    context
        .create_resource(uuid, ResourceProgress::Incomplete, Heightmap(1))
        .unwrap();
    assert!(!incremental.is_ready());
    assert!(!only_final.is_ready());

    let epoch = context
        .update_resource::<Heightmap, _>(uuid, |heightmap| {
            heightmap.0 = 2;
            ResourceProgress::Complete
        })
        .unwrap();
    assert_eq!(epoch, FINAL_EPOCH);

    assert_eq!(incremental.wait().unwrap(), vec![1, 2]);
    assert_eq!(only_final.wait().unwrap().resource, Heightmap(2));
    assert_eq!(
        loader
            .resource_registry()
            .state_of::<Heightmap>(uuid)
            .unwrap(),
        ResourceState::Complete
    );
}

#[test]
fn final_resources_reject_updates() {
    let (loader, contexts) = manual_loader();
    let uuid = Uuid::new_v4();
    let job = loader.load::<Heightmap>(uuid);
    let context = contexts.recv().unwrap();

    context
        .create_resource(uuid, ResourceProgress::Complete, Heightmap(7))
        .unwrap();
    assert!(matches!(
        context.update_resource::<Heightmap, _>(uuid, |_| ResourceProgress::Complete),
        Err(RuntimeError::AlreadyFinal { .. })
    ));
    assert!(matches!(
        context.create_resource(uuid, ResourceProgress::Complete, Heightmap(8)),
        Err(RuntimeError::AlreadyCached { .. })
    ));
    assert!(matches!(
        context.fail_resource::<Heightmap>(uuid, anyhow::anyhow!("too late")),
        Err(RuntimeError::NotPending { .. })
    ));
    assert_eq!(job.wait().unwrap().resource, Heightmap(7));
}

#[test]
fn failing_a_partial_resource_reaches_every_waiter() {
    let (loader, contexts) = manual_loader();
    let uuid = Uuid::new_v4();

    let incremental = follow_incrementally(&loader, uuid);
    let only_final = loader.load::<Heightmap>(uuid);
    let context = contexts.recv().unwrap();

    context
        .create_resource(uuid, ResourceProgress::Incomplete, Heightmap(1))
        .unwrap();
    context
        .fail_resource::<Heightmap>(uuid, anyhow::anyhow!("truncated file"))
        .unwrap();

    for result in [incremental.wait().map(|_| ()), only_final.wait().map(|_| ())] {
        match result {
            Err(JobError::Failed(error)) => assert_eq!(error.to_string(), "truncated file"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    let registry = loader.resource_registry();
    assert_eq!(
        registry.state_of::<Heightmap>(uuid).unwrap(),
        ResourceState::Absent
    );
    assert!(registry.try_get::<Heightmap>(uuid).unwrap().is_none());
}

#[test]
fn usage_counts_follow_public_copies() {
    let (loader, contexts) = manual_loader();
    let uuid = Uuid::new_v4();
    let job = loader.load::<Heightmap>(uuid);
    let context = contexts.recv().unwrap();

    let usage = context
        .create_resource(uuid, ResourceProgress::Complete, Heightmap(3))
        .unwrap();
    let public = job.wait().unwrap();
    let registry = loader.resource_registry();
    assert_eq!(registry.usage_count::<Heightmap>(uuid).unwrap(), Some(2));

    drop(usage);
    drop(public);
    assert_eq!(registry.usage_count::<Heightmap>(uuid).unwrap(), Some(0));
}

#[test]
fn loaders_run_once_per_pending_resource() {
    let loader = ResourceLoader::new(Arc::new(ResourceRegistry::new()), cradle());
    let calls = Arc::new(AtomicUsize::new(0));
    loader
        .register_loader::<Heightmap, _>({
            let calls = calls.clone();
            move |context, uuid| {
                calls.fetch_add(1, Ordering::SeqCst);
                let pool = context.thread_pool().clone();
                pool.emplace(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    context.create_resource(uuid, ResourceProgress::Complete, Heightmap(42))?;
                    Ok(())
                })
            }
        })
        .unwrap();

    let uuid = Uuid::new_v4();
    let jobs = (0..16)
        .map(|_| loader.load::<Heightmap>(uuid))
        .collect::<Vec<_>>();
    for job in jobs {
        assert_eq!(job.wait().unwrap().resource, Heightmap(42));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
