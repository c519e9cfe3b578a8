use std::sync::Arc;

use async_cradle::error::JobError;
use async_cradle::resource::loader::ResourceLoader;
use async_cradle::resource::{ResourceProgress, Uuid};
use async_cradle::runtime::job::Job;
use itertools::Itertools;
use log::info;

/// An opaque blob, as read from an archive.
#[derive(Clone, Debug)]
pub struct Blob(pub Arc<[u8]>);

pub fn register_blob_loader(loader: &ResourceLoader, failing: Option<Uuid>) -> anyhow::Result<()> {
    loader.register_loader::<Blob, _>(move |context, uuid| {
        let pool = context.thread_pool().clone();
        pool.emplace(move || {
            if failing == Some(uuid) {
                anyhow::bail!("Blob {uuid} is missing from every archive");
            }
            let bytes = uuid.as_bytes().iter().copied().cycle().take(4096).collect_vec();
            context.create_resource(uuid, ResourceProgress::Complete, Blob(bytes.into()))?;
            Ok(())
        })
    })?;
    Ok(())
}

/// Loads `count` blobs and waits for all of them on the completion context. Returns the number of
/// bytes loaded, or the first failure.
pub fn run(loader: &Arc<ResourceLoader>, count: usize, failing: Option<usize>) -> anyhow::Result<Result<usize, JobError>> {
    let blob_ids = (0..count).map(|_| Uuid::new_v4()).collect_vec();
    register_blob_loader(loader, failing.and_then(|index| blob_ids.get(index).copied()))?;

    let jobs = blob_ids
        .iter()
        .map(|&uuid| loader.load::<Blob>(uuid))
        .collect_vec();

    let completion_context = loader.cradle().completion_context.clone();
    let all_loaded = Job::new(async move { Ok(completion_context.until_all_succeed(jobs).await?) });

    let outcome = all_loaded.wait().map(|blobs| {
        blobs
            .iter()
            .map(|blob| blob.resource.0.len())
            .sum::<usize>()
    });
    info!("Batch of {count} blobs finished: {outcome:?}");
    Ok(outcome)
}
