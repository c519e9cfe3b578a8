//! An asynchronous resource loading runtime.
//!
//! The crate is made of three layers that build on each other:
//!
//! - [`runtime`]: the [`runtime::job::Job`] task primitive (eagerly started, resumed by whoever
//!   wakes it), the executors a job can reschedule itself onto and the [`runtime::completion`]
//!   scheduler that turns "wait until this is ready" into a suspension instead of a blocked thread.
//! - [`resource`]: the typed, epoch-versioned [`resource::registry::ResourceRegistry`], the loader
//!   dispatch that fills it incrementally and the unpackers that consume it.
//! - [`resource::aba`]: the tag protocol consumers follow when they write into destinations that
//!   may be destroyed or reused while they are suspended.
//!
//! Everything that produces or consumes actual resources (meshes, textures, scene objects) lives
//! outside of this crate and only talks to it through the typed APIs.
pub mod error;
pub mod resource;
pub mod runtime;
pub mod util;
