use async_cradle::runtime::cradle::CradleConfig;
use async_cradle::runtime::thread_pool::ThreadPool;
use clap::{Parser, Subcommand, value_parser};
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "async-cradle")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drives the asynchronous resource runtime through a streaming demo")]
pub struct CliArgs {
    #[arg(long, env = "CRADLE_TASK_POOL_SIZE", default_value_t = ThreadPool::default_thread_count())]
    pub task_pool_size: usize,

    #[arg(long, env = "CRADLE_LOADING_POOL_SIZE", default_value_t = ThreadPool::default_thread_count())]
    pub loading_pool_size: usize,

    #[arg(long, env = "CRADLE_SLEEP_BUDGET_US", default_value_t = 100)]
    pub sleep_budget_us: u64,

    #[command(subcommand)]
    pub operation_mode: OperationMode,
}

impl CliArgs {
    pub fn cradle_config(&self) -> CradleConfig {
        CradleConfig {
            task_pool_size: self.task_pool_size.max(1),
            loading_pool_size: self.loading_pool_size.max(1),
            sleep_budget: Duration::from_micros(self.sleep_budget_us),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum OperationMode {
    /// Streams meshes level of detail by level of detail into a world of entities.
    Stream {
        #[arg(long, default_value_t = 4)]
        lods: u32,
        #[arg(long, default_value_t = 16)]
        objects: usize,
        #[arg(long, default_value_t = 20)]
        lod_delay_ms: u64,
        #[arg(
            long,
            help = "Entities to despawn while their meshes are still streaming, e.g. 1,5,7"
        )]
        despawn: Option<IndexList>,
        #[arg(long, value_parser = value_parser!(u32), help = "Make every n-th mesh fail to load")]
        fail_every: Option<u32>,
    },
    /// Loads a batch of resources and waits for all of them on the completion context.
    Batch {
        #[arg(long, default_value_t = 8)]
        count: usize,
        #[arg(long, help = "Index of a resource whose load fails")]
        failing: Option<usize>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct IndexList(pub Vec<usize>);

impl FromStr for IndexList {
    type Err = String;

    // 1,2,3
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let indices = s
            .split(',')
            .map(str::trim)
            .filter(|split| !split.is_empty())
            .map(|split| {
                split
                    .parse::<usize>()
                    .map_err(|err| format!("Invalid index \"{}\": {}", split, err))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IndexList(indices))
    }
}
