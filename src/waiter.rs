//! Bounded waiting for a condition over the current state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};

use crate::coordinator::StateCoordinator;
use crate::error::CoordinatorError;
use crate::state::{same_state, StateRef};

impl StateCoordinator {
    /// Wait until the current state satisfies `predicate`, returning the
    /// first matching state.
    ///
    /// If the predicate already holds for the current state this returns
    /// without waiting. Otherwise the caller is suspended until a matching
    /// state is activated or `timeout` elapses, whichever comes first. A
    /// predicate that panics is treated as "not satisfied", so a buggy
    /// predicate surfaces as [`CoordinatorError::WaitTimeout`] rather than
    /// corrupting the coordinator.
    pub async fn wait_until<F>(
        &self,
        mut predicate: F,
        timeout: Duration,
    ) -> Result<StateRef, CoordinatorError>
    where
        F: FnMut(&StateRef) -> bool,
    {
        let started = Instant::now();
        let deadline = started + timeout;

        if let Some(state) = self.current_state() {
            if check(&mut predicate, &state) {
                return Ok(state);
            }
        }

        let mut subscription = self.subscribe();

        // The desired transition may have happened between the first check
        // and the subscription.
        if let Some(state) = self.current_state() {
            if check(&mut predicate, &state) {
                return Ok(state);
            }
        }

        loop {
            match timeout_at(deadline, subscription.next()).await {
                Ok(Some(state)) => {
                    if check(&mut predicate, &state) {
                        return Ok(state);
                    }
                }
                // Cycle completed without a match: no further state will be
                // activated in this cycle, so give up early.
                Ok(None) | Err(_) => {
                    return Err(CoordinatorError::WaitTimeout {
                        waited: started.elapsed().min(timeout),
                    });
                }
            }
        }
    }

    /// Wait until `expected` becomes the current state.
    ///
    /// Comparison is by identity (the same `Arc`), not equality-by-value.
    pub async fn wait_for_state(
        &self,
        expected: &StateRef,
        timeout: Duration,
    ) -> Result<StateRef, CoordinatorError> {
        let expected = Arc::clone(expected);
        self.wait_until(move |state| same_state(state, &expected), timeout)
            .await
    }
}

fn check<F>(predicate: &mut F, state: &StateRef) -> bool
where
    F: FnMut(&StateRef) -> bool,
{
    catch_unwind(AssertUnwindSafe(|| predicate(state))).unwrap_or_else(|_| {
        log::warn!(
            "[coordinator] wait predicate panicked on state '{}'",
            state.name()
        );
        false
    })
}
