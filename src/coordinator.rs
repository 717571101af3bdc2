//! The coordinator: a serialized transition worker plus the run supervisor.
//!
//! All state swapping happens on a single worker task fed by an unbounded
//! command channel. The single consumer is what gives transitions their FIFO
//! guarantee: a request enqueued second can never be applied first, and run
//! routine N+1 is never spawned before run routine N has been joined.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CoordinatorError;
use crate::events::{StateEventStream, StateSubscription};
use crate::state::StateRef;

enum Command {
    Transition(StateRef),
    Stop(oneshot::Sender<()>),
}

enum ControlSlot {
    Idle,
    Running(Control),
    Stopping,
}

struct Control {
    commands: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

/// Drives an application through a sequence of mutually exclusive,
/// asynchronously running states.
///
/// Only one state's run routine is active at a time; activities are wound
/// down (cancelled and joined, exit hook attempted) before the next state
/// starts, and every activation is published on the event stream. Transition
/// requests never block the caller and are applied strictly in submission
/// order.
///
/// `stop().await` before dropping the coordinator; an abandoned coordinator
/// leaves its worker task to the runtime.
pub struct StateCoordinator {
    shared: Arc<Shared>,
    control: Mutex<ControlSlot>,
    next_generation: AtomicU64,
}

struct Shared {
    current: RwLock<Option<StateRef>>,
    events: RwLock<Arc<StateEventStream>>,
    stopping: AtomicBool,
}

impl Shared {
    fn current(&self) -> Option<StateRef> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear_current(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Install and publish the new state under one write lock, so no reader
    /// can observe the slot between "set" and "published".
    fn install_current(&self, state: &StateRef) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Some(Arc::clone(state));
        self.events().publish(Arc::clone(state));
    }

    fn events(&self) -> Arc<StateEventStream> {
        Arc::clone(&self.events.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace_events(&self, generation: u64) {
        *self.events.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(StateEventStream::new(generation));
    }
}

impl StateCoordinator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                current: RwLock::new(None),
                events: RwLock::new(Arc::new(StateEventStream::new(0))),
                stopping: AtomicBool::new(false),
            }),
            control: Mutex::new(ControlSlot::Idle),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Begin the lifecycle with `initial`.
    ///
    /// Must be called from within a tokio runtime. Fails with
    /// [`CoordinatorError::AlreadyStarted`] if a lifecycle is already active
    /// (including one that is still shutting down).
    pub fn start(&self, initial: StateRef) -> Result<(), CoordinatorError> {
        let mut slot = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*slot, ControlSlot::Idle) {
            return Err(CoordinatorError::AlreadyStarted);
        }

        self.shared.stopping.store(false, Ordering::SeqCst);
        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(Arc::clone(&self.shared), receiver));

        log::info!("[coordinator] starting with state '{}'", initial.name());
        let _ = commands.send(Command::Transition(initial));

        *slot = ControlSlot::Running(Control { commands, worker });
        Ok(())
    }

    /// Request a transition to `next`.
    ///
    /// Never blocks: the request is appended to the FIFO queue and applied
    /// by the worker after every previously accepted request has fully
    /// finished. Failures while applying (hook errors, run routine errors)
    /// are logged, never surfaced here.
    pub fn transition_to(&self, next: StateRef) {
        let slot = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        match &*slot {
            ControlSlot::Running(control) => {
                if control.commands.send(Command::Transition(next)).is_err() {
                    log::warn!("[coordinator] transition request dropped, worker is gone");
                }
            }
            ControlSlot::Idle | ControlSlot::Stopping => {
                log::warn!(
                    "[coordinator] transition to '{}' ignored, coordinator is not running",
                    next.name()
                );
            }
        }
    }

    /// Shut the lifecycle down.
    ///
    /// Already-queued transitions drain without activating anything, the
    /// final run routine is cancelled and joined, its exit hook runs, the
    /// active-state slot is cleared and the event stream completes and is
    /// replaced by a fresh cycle. Idempotent; a no-op when nothing is
    /// active.
    pub async fn stop(&self) {
        let control = {
            let mut slot = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *slot, ControlSlot::Stopping) {
                ControlSlot::Running(control) => control,
                other => {
                    *slot = other;
                    log::debug!("[coordinator] stop ignored, not running");
                    return;
                }
            }
        };

        self.shared.stopping.store(true, Ordering::SeqCst);

        let (ack, acked) = oneshot::channel();
        if control.commands.send(Command::Stop(ack)).is_ok() {
            let _ = acked.await;
        }
        if let Err(join_error) = control.worker.await {
            if join_error.is_panic() {
                log::error!("[coordinator] worker panicked during shutdown: {join_error}");
            }
        }

        // Fresh cycle for the next start.
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.shared.replace_events(generation);
        self.shared.stopping.store(false, Ordering::SeqCst);

        *self.control.lock().unwrap_or_else(PoisonError::into_inner) = ControlSlot::Idle;
        log::info!("[coordinator] stopped");
    }

    /// The active state, or `None` between lifecycles (and briefly while a
    /// transition is in flight). Safe for concurrent callers.
    pub fn current_state(&self) -> Option<StateRef> {
        self.shared.current()
    }

    /// Subscribe to the current cycle's event stream.
    pub fn subscribe(&self) -> StateSubscription {
        self.event_stream().subscribe()
    }

    /// Handle to the current cycle of the event stream. The handle stays
    /// valid across `stop`, which lets observers witness that particular
    /// cycle's completion.
    pub fn event_stream(&self) -> Arc<StateEventStream> {
        self.shared.events()
    }
}

impl Default for StateCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveRun {
    state: StateRef,
    cancel: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

async fn run_worker(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut active: Option<ActiveRun> = None;
    while let Some(command) = commands.recv().await {
        match command {
            Command::Transition(next) => apply_transition(&shared, &mut active, next).await,
            Command::Stop(ack) => {
                retire_active(&shared, &mut active).await;
                shared.events().complete();
                log::debug!("[coordinator] shutdown complete");
                let _ = ack.send(());
                break;
            }
        }
    }
}

/// Apply one queued transition. Runs only on the worker, so each step here
/// is serialized with respect to every other transition.
async fn apply_transition(shared: &Shared, active: &mut Option<ActiveRun>, next: StateRef) {
    let from = active.as_ref().map(|run| run.state.name().to_string());
    retire_active(shared, active).await;

    if shared.stopping.load(Ordering::SeqCst) {
        log::debug!(
            "[coordinator] stop requested, not activating '{}'",
            next.name()
        );
        return;
    }

    log::info!(
        "[coordinator] transition {} -> {}",
        from.as_deref().unwrap_or("<none>"),
        next.name()
    );

    let cancel = CancellationToken::new();
    shared.install_current(&next);
    run_hook("enter", &next, || next.on_enter());

    let task = tokio::spawn({
        let state = Arc::clone(&next);
        let cancel = cancel.clone();
        async move { state.run(cancel).await }
    });

    *active = Some(ActiveRun {
        state: next,
        cancel,
        task,
    });
}

/// Cancel the active run, wait for it to fully finish, then attempt its
/// exit hook and clear the active-state slot. Never propagates failures.
async fn retire_active(shared: &Shared, active: &mut Option<ActiveRun>) {
    let Some(run) = active.take() else {
        return;
    };

    run.cancel.cancel();
    match run.task.await {
        Ok(Ok(())) => {
            log::debug!("[coordinator] run routine of '{}' finished", run.state.name());
        }
        Ok(Err(error)) => {
            log::warn!(
                "[coordinator] run routine of '{}' failed: {error:#}",
                run.state.name()
            );
        }
        Err(join_error) if join_error.is_panic() => {
            log::error!(
                "[coordinator] run routine of '{}' panicked: {join_error}",
                run.state.name()
            );
        }
        Err(join_error) => {
            log::warn!(
                "[coordinator] run task of '{}' was aborted: {join_error}",
                run.state.name()
            );
        }
    }

    run_hook("exit", &run.state, || run.state.on_exit());
    shared.clear_current();
}

fn run_hook(kind: &str, state: &StateRef, hook: impl FnOnce() -> anyhow::Result<()>) {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            log::error!(
                "[coordinator] {kind} hook of '{}' failed: {error:#}",
                state.name()
            );
        }
        Err(_) => {
            log::error!("[coordinator] {kind} hook of '{}' panicked", state.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_test::assert_ok;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::state::State;

    struct Named(&'static str);

    #[async_trait]
    impl State for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn state(name: &'static str) -> StateRef {
        Arc::new(Named(name))
    }

    #[tokio::test]
    async fn start_twice_is_a_usage_error() {
        let coordinator = StateCoordinator::new();
        tokio_test::assert_ok!(coordinator.start(state("a")));
        assert!(matches!(
            coordinator.start(state("b")),
            Err(CoordinatorError::AlreadyStarted)
        ));
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn transition_before_start_is_ignored() {
        let coordinator = StateCoordinator::new();
        coordinator.transition_to(state("a"));
        assert!(coordinator.current_state().is_none());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let coordinator = StateCoordinator::new();
        coordinator.stop().await;

        coordinator
            .start(state("a"))
            .expect("fresh coordinator starts");
        coordinator.stop().await;
        coordinator.stop().await;
        assert!(coordinator.current_state().is_none());
    }

    #[tokio::test]
    async fn restart_after_stop_gets_a_fresh_cycle() {
        let coordinator = StateCoordinator::new();
        coordinator.start(state("a")).expect("first start");
        let first_cycle = coordinator.event_stream();
        coordinator.stop().await;

        assert!(first_cycle.is_completed());
        coordinator.start(state("b")).expect("restart after stop");
        let second_cycle = coordinator.event_stream();
        assert!(second_cycle.generation() > first_cycle.generation());
        assert!(!second_cycle.is_completed());
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn stop_clears_the_active_state() {
        let coordinator = StateCoordinator::new();
        let initial = state("a");
        coordinator.start(Arc::clone(&initial)).expect("start");
        coordinator
            .wait_for_state(&initial, Duration::from_secs(5))
            .await
            .expect("initial state becomes current");

        coordinator.stop().await;
        assert!(coordinator.current_state().is_none());
    }
}
