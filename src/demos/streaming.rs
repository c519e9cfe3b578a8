use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_cradle::resource::aba::{AbaTag, Admission, IncrementalDestination, UnpackOutcome, unpack_incrementally};
use async_cradle::resource::loader::ResourceLoader;
use async_cradle::resource::unpacker::ResourceUnpacker;
use async_cradle::resource::{PublicResource, ResourceProgress, Uuid};
use async_cradle::runtime::executor::reschedule_to;
use async_cradle::runtime::job::Job;
use hecs::{Entity, World};
use itertools::Itertools;
use log::{info, trace, warn};

use crate::demos::IDLE_FLUSH_SLEEP;

#[derive(Clone, Debug)]
pub struct MeshLod {
    pub level: u32,
    pub triangle_count: usize,
}

/// A mesh that is streamed coarse to fine, one level of detail per published version.
#[derive(Clone, Debug, Default)]
pub struct StreamedMesh {
    pub lods: Vec<MeshLod>,
}

impl StreamedMesh {
    pub fn finest_level(&self) -> Option<u32> {
        self.lods.last().map(|lod| lod.level)
    }
}

/// Component written by the mesh unpacker. The render pass reads the mesh through the swap
/// without holding the world lock.
pub struct MeshComponent {
    pub tag: AbaTag,
    pub mesh: Arc<ArcSwap<StreamedMesh>>,
}

/// An entity that wants a mesh.
pub struct EntityDestination {
    pub world: Arc<RwLock<World>>,
    pub entity: Entity,
}

impl IncrementalDestination<StreamedMesh> for EntityDestination {
    fn first_write(&mut self, tag: AbaTag, resource: PublicResource<StreamedMesh>) -> Admission {
        let mut world = self.world.write().expect("World Write Lock");
        let already_present = world.get::<&MeshComponent>(self.entity).is_ok();
        let admission = tag.admit_first_write(world.contains(self.entity), already_present);

        if admission == Admission::Proceed {
            let component = MeshComponent {
                tag,
                mesh: Arc::new(ArcSwap::from_pointee(resource.resource)),
            };
            if world.insert_one(self.entity, component).is_err() {
                return Admission::Bail;
            }
        }
        admission
    }

    fn update(&mut self, tag: AbaTag, resource: PublicResource<StreamedMesh>) -> Admission {
        let world = self.world.read().expect("World Read Lock");
        let component = world.get::<&MeshComponent>(self.entity).ok();
        let admission = tag.admit_update(
            world.contains(self.entity),
            component.as_ref().map(|component| component.tag),
        );

        if let (Admission::Proceed, Some(component)) = (admission, component) {
            component.mesh.store(Arc::new(resource.resource));
        }
        admission
    }
}

#[derive(Clone, Debug)]
pub struct StreamingSettings {
    pub lods: u32,
    pub objects: usize,
    pub lod_delay: Duration,
    pub despawn: Vec<usize>,
    pub fail_every: Option<u32>,
}

/// Publishes one level of detail after the other on the loading pool.
pub fn register_mesh_loader(
    loader: &ResourceLoader,
    lods: u32,
    lod_delay: Duration,
    failing: HashSet<Uuid>,
) -> anyhow::Result<()> {
    let lods = lods.max(1);
    let failing = Arc::new(failing);

    loader.register_loader::<StreamedMesh, _>(move |context, uuid| {
        let failing = failing.clone();
        let pool = context.thread_pool().clone();

        Job::new(async move {
            reschedule_to(&pool).await;

            for level in 0..lods {
                std::thread::sleep(lod_delay);
                if level > 0 && failing.contains(&uuid) {
                    anyhow::bail!("Mesh {uuid} is corrupt past its first level of detail");
                }

                let lod = MeshLod {
                    level,
                    triangle_count: 12usize.checked_shl(2 * level).unwrap_or(usize::MAX),
                };
                let progress = if level + 1 == lods {
                    ResourceProgress::Complete
                } else {
                    ResourceProgress::Incomplete
                };

                if level == 0 {
                    context.create_resource(uuid, progress, StreamedMesh { lods: vec![lod] })?;
                } else {
                    context.update_resource::<StreamedMesh, _>(uuid, |mesh| {
                        mesh.lods.push(lod);
                        progress
                    })?;
                }
                trace!("Published level {level} of mesh {uuid}");
            }
            Ok(())
        })
    })?;
    Ok(())
}

/// Follows a mesh into its entity on the local context.
pub fn register_mesh_unpacker(unpacker: &ResourceUnpacker) -> anyhow::Result<()> {
    unpacker.register_unpacker::<StreamedMesh, EntityDestination, _>(|context, uuid, mut destination| {
        let local_context = context.local_context().clone();
        Job::new(async move {
            let outcome = unpack_incrementally::<StreamedMesh, _, _>(
                context.resource_loader(),
                &local_context,
                uuid,
                &mut destination,
            )
            .await?;

            match outcome {
                UnpackOutcome::Complete => trace!("Mesh {uuid} fully streamed"),
                UnpackOutcome::Bailed { writes } => {
                    info!("Stopped streaming mesh {uuid} after {writes} levels, its entity is gone")
                }
            }
            Ok(())
        })
    })?;
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct StreamingReport {
    pub complete: usize,
    pub despawned: usize,
    pub failed: usize,
}

pub fn run(loader: &Arc<ResourceLoader>, unpacker: &Arc<ResourceUnpacker>, settings: &StreamingSettings) -> anyhow::Result<StreamingReport> {
    let mesh_ids = (0..settings.objects)
        .map(|_| Uuid::new_v4())
        .collect_vec();
    let failing: HashSet<Uuid> = match settings.fail_every {
        Some(every) if every > 0 => mesh_ids
            .iter()
            .copied()
            .skip(every as usize - 1)
            .step_by(every as usize)
            .collect(),
        _ => HashSet::new(),
    };

    register_mesh_loader(loader, settings.lods, settings.lod_delay, failing)?;
    register_mesh_unpacker(unpacker)?;

    let world = Arc::new(RwLock::new(World::new()));
    let entities = {
        let mut world = world.write().expect("World Write Lock");
        (0..settings.objects)
            .map(|index| world.spawn((index,)))
            .collect_vec()
    };

    let jobs = mesh_ids
        .iter()
        .zip(entities.iter())
        .map(|(&uuid, &entity)| {
            unpacker.unpack::<StreamedMesh, _>(uuid, EntityDestination {
                world: world.clone(),
                entity,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let local_context = &loader.cradle().local_context;
    let mut to_despawn = settings
        .despawn
        .iter()
        .filter_map(|&index| entities.get(index).copied())
        .collect_vec();

    while !jobs.iter().all(Job::is_ready) {
        let ran = local_context.flush_strong();

        // Entities go away as soon as their first level of detail arrived, mid stream.
        to_despawn.retain(|&entity| {
            let mut world = world.write().expect("World Write Lock");
            if world.get::<&MeshComponent>(entity).is_err() {
                return true;
            }
            let _ = world.despawn(entity);
            info!("Despawned {entity:?} while its mesh was streaming");
            false
        });

        if ran == 0 {
            std::thread::sleep(IDLE_FLUSH_SLEEP);
        }
    }

    let mut report = StreamingReport::default();
    for (job, entity) in jobs.into_iter().zip(entities.iter()) {
        if let Err(error) = job.extract_result() {
            warn!("Streaming into {entity:?} failed: {error}");
            report.failed += 1;
        } else if !world
            .read()
            .expect("World Read Lock")
            .contains(*entity)
        {
            report.despawned += 1;
        } else {
            report.complete += 1;
        }
    }

    render_pass(&world);
    Ok(report)
}

/// Reads every mesh the way a renderer would, from snapshots taken outside the world lock.
fn render_pass(world: &RwLock<World>) {
    let meshes = {
        let world = world.read().expect("World Read Lock");
        world
            .query::<&MeshComponent>()
            .iter()
            .map(|(entity, component)| (entity, component.mesh.clone()))
            .collect_vec()
    };

    for (entity, mesh) in meshes {
        let mesh = mesh.load();
        let triangles: usize = mesh.lods.iter().map(|lod| lod.triangle_count).sum();
        info!(
            "{entity:?}: finest level {:?}, {triangles} triangles over all levels",
            mesh.finest_level()
        );
    }
}
