//! The state contract supplied by applications.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A unit of behavior driven by the coordinator.
///
/// Applications implement this trait once per lifecycle state. The
/// coordinator guarantees that at most one `run` is executing at any
/// instant and that the outgoing state's `on_exit` has been attempted
/// before the next state's `on_enter` is invoked.
#[async_trait]
pub trait State: Send + Sync {
    /// Display name, used in diagnostics only.
    fn name(&self) -> &str;

    /// Called after the state becomes current, before its run routine
    /// starts. Failures are logged by the coordinator and never abort the
    /// transition.
    fn on_enter(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after the state's run routine has finished, before the next
    /// state is activated. Failures are logged and never abort the
    /// transition.
    fn on_exit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// The long-running activity owned by this state.
    ///
    /// Cancellation is cooperative: the routine must observe `cancel` and
    /// return. The coordinator always waits for this to finish before
    /// activating the next state, so cancellation latency becomes
    /// transition latency.
    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()>;
}

impl std::fmt::Debug for dyn State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State").field("name", &self.name()).finish()
    }
}

/// Shared handle to a state.
///
/// Identity (as used by [`crate::StateCoordinator::wait_for_state`]) is
/// pointer identity of the `Arc`, not structural equality.
pub type StateRef = Arc<dyn State>;

pub(crate) fn same_state(a: &StateRef, b: &StateRef) -> bool {
    Arc::ptr_eq(a, b)
}
