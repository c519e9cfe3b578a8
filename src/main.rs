use crate::demos::streaming::StreamingSettings;
use crate::settings::{CliArgs, OperationMode};
use async_cradle::resource::loader::ResourceLoader;
use async_cradle::resource::registry::ResourceRegistry;
use async_cradle::resource::unpacker::ResourceUnpacker;
use async_cradle::runtime::cradle::AsyncCradle;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

mod demos;
mod settings;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = CliArgs::parse();
    log::trace!("Starting with args: {:?}", args);

    let cradle = Arc::new(AsyncCradle::new(&args.cradle_config())?);
    let loader = ResourceLoader::new(Arc::new(ResourceRegistry::new()), cradle.clone());
    let unpacker = ResourceUnpacker::new(loader.clone());

    match args.operation_mode {
        OperationMode::Stream {
            lods,
            objects,
            lod_delay_ms,
            despawn,
            fail_every,
        } => {
            let settings = StreamingSettings {
                lods,
                objects,
                lod_delay: Duration::from_millis(lod_delay_ms),
                despawn: despawn.map(|list| list.0).unwrap_or_default(),
                fail_every,
            };
            let report = demos::streaming::run(&loader, &unpacker, &settings)?;
            log::info!(
                "Streaming finished: {} complete, {} despawned, {} failed",
                report.complete,
                report.despawned,
                report.failed
            );
        }
        OperationMode::Batch { count, failing } => {
            if let Err(error) = demos::batch::run(&loader, count, failing)? {
                log::warn!("Batch failed: {error}");
            }
        }
    }

    cradle
        .local_context
        .drain_all_tasks(demos::IDLE_FLUSH_SLEEP);
    Ok(())
}
