//! Container liveness as reported by the container runtime.

use std::fmt;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::Result;

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Exited.
    Exited,
    /// State could not be determined.
    Unknown,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Unknown => "unknown",
        })
    }
}

/// The status call of a container runtime.
pub trait RuntimeService: Send + Sync {
    /// Returns the current state of `container_id`.
    fn container_status<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Result<ContainerState>>;
}

/// Whether `container_id` is running.
///
/// A runtime error is returned as is; any state other than running is
/// `false`, since containers normally stop while their logs are followed.
pub async fn is_container_running(runtime: &dyn RuntimeService, container_id: &str) -> Result<bool> {
    let state = runtime.container_status(container_id).await?;
    if state != ContainerState::Running {
        tracing::debug!(container_id, %state, "container is not running");
        return Ok(false);
    }
    Ok(true)
}

/// A runtime whose answer is set by the caller.
///
/// Used when logs are read outside a container runtime, for example by the
/// node CLI, and in tests.
#[derive(Debug)]
pub struct StaticRuntime {
    state: RwLock<ContainerState>,
}

impl StaticRuntime {
    /// Creates a runtime reporting `state` for every container.
    #[must_use]
    pub fn new(state: ContainerState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Changes the reported state.
    pub fn set_state(&self, state: ContainerState) {
        *self.state.write() = state;
    }
}

impl RuntimeService for StaticRuntime {
    fn container_status<'a>(&'a self, _container_id: &'a str) -> BoxFuture<'a, Result<ContainerState>> {
        let state = *self.state.read();
        async move { Ok(state) }.boxed()
    }
}
