//! state_coordinator - serialized lifecycle coordinator for async states
//!
//! This crate drives an application through a sequence of mutually
//! exclusive, asynchronously running states. Each state owns a cancellable
//! run routine plus synchronous enter/exit hooks; the coordinator
//! guarantees that only one run routine is active at a time, that the
//! previous activity is cancelled and joined (and its exit hook attempted)
//! before the next state starts, and that every activation is published on
//! a multi-subscriber event stream.
//!
//! Transition requests are applied strictly in submission order by a single
//! worker task, even when requested concurrently from many tasks. Hook and
//! run-routine failures are logged via the `log` facade and never wedge the
//! machine.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod state;

mod waiter;

// Re-export commonly used types
pub use coordinator::StateCoordinator;
pub use error::CoordinatorError;
pub use events::{StateEventStream, StateSubscription};
pub use state::{State, StateRef};
