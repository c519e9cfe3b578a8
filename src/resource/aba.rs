//! Guarding writes into destinations that can change while an unpacker is suspended.
//!
//! An unpacker that follows a resource incrementally suspends between updates, sometimes for a
//! long time. Meanwhile its destination may be destroyed, or destroyed and replaced by an
//! unrelated object that happens to have the same handle, or claimed by another unpacker. Before
//! every write the unpacker therefore re-checks its destination against a tag it stored there on
//! its first write, and silently stops ("bails") if anything changed.
//!
//! Bailing is not an error. Cancelling an unpacker is done by invalidating its destination.
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};

use crate::resource::loader::ResourceLoader;
use crate::resource::{FINAL_EPOCH, NULL_EPOCH, PublicResource, Resource, Uuid};
use crate::runtime::executor::{Executor, reschedule_to};

/// A nonce identifying one run of one unpacker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AbaTag(NonZeroU64);

impl AbaTag {
    pub fn new() -> Self {
        static NEXT_TAG: AtomicU64 = AtomicU64::new(1);
        let tag = NEXT_TAG.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(tag).unwrap_or(NonZeroU64::MIN))
    }

    /// The first writer wins: a destination that is gone or already carries the target component
    /// belongs to somebody else.
    pub fn admit_first_write(self, destination_valid: bool, already_present: bool) -> Admission {
        if destination_valid && !already_present {
            Admission::Proceed
        } else {
            Admission::Bail
        }
    }

    /// Later writes only go to a destination that still exists and still carries our tag.
    pub fn admit_update(self, destination_valid: bool, stored: Option<AbaTag>) -> Admission {
        if destination_valid && stored == Some(self) {
            Admission::Proceed
        } else {
            Admission::Bail
        }
    }
}

impl Default for AbaTag {
    fn default() -> Self {
        Self::new()
    }
}

#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    Bail,
}

/// A destination an unpacker writes successive versions of a resource into.
///
/// Both methods run on the executor passed to [`unpack_incrementally`] and are expected to check
/// admission with the tag before touching anything.
pub trait IncrementalDestination<T>: Send {
    /// Writes the first version, storing `tag` next to it.
    fn first_write(&mut self, tag: AbaTag, resource: PublicResource<T>) -> Admission;
    /// Replaces a previously written version.
    fn update(&mut self, tag: AbaTag, resource: PublicResource<T>) -> Admission;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnpackOutcome {
    /// The final version was written.
    Complete,
    /// The destination changed, `writes` versions had been written before.
    Bailed { writes: usize },
}

/// Follows `uuid` from its first published version to the final one and writes every version it
/// sees into `destination`, on `executor`.
pub async fn unpack_incrementally<T, D, E>(
    loader: &ResourceLoader,
    executor: &E,
    uuid: Uuid,
    destination: &mut D,
) -> anyhow::Result<UnpackOutcome>
where
    T: Resource,
    D: IncrementalDestination<T>,
    E: Executor + Clone + 'static,
{
    let tag = AbaTag::new();
    let mut epoch = NULL_EPOCH;
    let mut writes = 0;

    loop {
        let resource = loader
            .get_resource::<T>(uuid, Some(&mut epoch))
            .await?;
        reschedule_to(executor).await;

        let admission = if writes == 0 {
            destination.first_write(tag, resource)
        } else {
            destination.update(tag, resource)
        };

        if admission == Admission::Bail {
            debug!("Unpacking {uuid} bailed after {writes} writes, its destination changed");
            return Ok(UnpackOutcome::Bailed { writes });
        }

        writes += 1;
        trace!("Unpacked {uuid} at epoch {epoch}");
        if epoch == FINAL_EPOCH {
            return Ok(UnpackOutcome::Complete);
        }
    }
}
