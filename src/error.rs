use std::any::Any;
use std::sync::Arc;

use uuid::Uuid;

/// The failure captured into a [`crate::runtime::job::Job`] when its body returned an error or
/// panicked.
///
/// One failed load is delivered to every waiter of that resource, hence `Clone`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0:#}")]
    Failed(Arc<anyhow::Error>),
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        JobError::Panicked(message)
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        // A JobError that travelled through `?` into an anyhow body comes back unchanged.
        match error.downcast::<JobError>() {
            Ok(job_error) => job_error,
            Err(error) => JobError::Failed(Arc::new(error)),
        }
    }
}

impl From<RuntimeError> for JobError {
    fn from(error: RuntimeError) -> Self {
        JobError::Failed(Arc::new(anyhow::Error::new(error)))
    }
}

/// Misuse of the resource APIs that is reported instead of asserted.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("no storage has been initialized for resource type {type_name}")]
    StorageNotInitialized { type_name: &'static str },
    #[error("no loader is registered for resource type {type_name}")]
    NoLoader { type_name: &'static str },
    #[error("a loader for resource type {type_name} is already registered")]
    LoaderAlreadyRegistered { type_name: &'static str },
    #[error("no unpacker found for resource type {resource} and destination type {destination}")]
    NoUnpacker {
        resource: &'static str,
        destination: &'static str,
    },
    #[error("an unpacker for resource type {resource} and destination type {destination} is already registered")]
    UnpackerAlreadyRegistered {
        resource: &'static str,
        destination: &'static str,
    },
    #[error("resource {uuid} of type {type_name} is already cached")]
    AlreadyCached { type_name: &'static str, uuid: Uuid },
    #[error("resource {uuid} of type {type_name} is not being loaded")]
    NotPending { type_name: &'static str, uuid: Uuid },
    #[error("resource {uuid} of type {type_name} is not cached")]
    NotCached { type_name: &'static str, uuid: Uuid },
    #[error("resource {uuid} of type {type_name} has already reached its final epoch")]
    AlreadyFinal { type_name: &'static str, uuid: Uuid },
}
