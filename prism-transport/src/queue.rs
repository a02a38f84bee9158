//! Async driver for the [`Scheduler`].
//!
//! One task owns the connector and keeps at most one unit on the wire.
//! Submissions wake it through a [`Notify`]; while a unit is in flight new
//! work simply accumulates and is drained when the unit completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use prism_core::{Command, CommandError, RenderCommand, Response, StateRef};

use crate::batch::ResponseCallback;
use crate::callback::{log_callback_errors, CallbackErrorHandler};
use crate::connector::Connector;
use crate::scheduler::{Phase, Producer, Scheduler, Ticket};

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Scope for the command. The queue's default state when `None`.
    pub state: Option<StateRef>,
    /// Queue without waking the driver; see [`CommandQueue::process`].
    pub delay_processing: bool,
}

impl SubmitOptions {
    pub fn in_state(state: StateRef) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn delayed(mut self) -> Self {
        self.delay_processing = true;
        self
    }
}

struct Shared {
    scheduler: Mutex<Scheduler>,
    wake: Notify,
    closed: AtomicBool,
    on_callback_error: CallbackErrorHandler,
}

impl Shared {
    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Command queue bound to one connector.
///
/// Producers run while the queue's lock is held, so a producer must use
/// its [`BatchBuilder`](crate::scheduler::BatchBuilder) rather than call
/// back into the queue.
pub struct CommandQueue {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl CommandQueue {
    pub fn spawn<C: Connector>(connector: C, default_state: StateRef) -> Self {
        Self::spawn_with_handler(connector, default_state, log_callback_errors())
    }

    /// `on_callback_error` receives panics from callbacks, sinks and producers.
    pub fn spawn_with_handler<C: Connector>(
        connector: C,
        default_state: StateRef,
        on_callback_error: CallbackErrorHandler,
    ) -> Self {
        let shared = Arc::new(Shared {
            scheduler: Mutex::new(Scheduler::new(default_state)),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            on_callback_error,
        });
        let driver = tokio::spawn(drive(shared.clone(), connector));
        Self { shared, driver }
    }

    fn wake_unless(&self, delay: bool) {
        if !delay {
            self.shared.wake.notify_one();
        }
    }

    pub fn submit(
        &self,
        command: Command,
        callback: Option<ResponseCallback>,
        options: SubmitOptions,
    ) -> Ticket {
        let ticket = self
            .shared
            .scheduler()
            .submit(command, callback, options.state);
        self.wake_unless(options.delay_processing);
        ticket
    }

    pub fn submit_render(&self, render: RenderCommand, options: SubmitOptions) -> Ticket {
        let ticket = self.shared.scheduler().submit_render(render, options.state);
        self.wake_unless(options.delay_processing);
        ticket
    }

    pub fn register_producer(&self, producer: Producer, options: SubmitOptions) -> Ticket {
        let ticket = self.shared.scheduler().enqueue(producer, options.state);
        self.wake_unless(options.delay_processing);
        ticket
    }

    /// Submits a command and waits for its result.
    ///
    /// Resolves to [`CommandError::aborted`] when the command is dropped
    /// without a response, as with a suppressed unit.
    pub async fn call(&self, command: Command, state: Option<StateRef>) -> Response {
        let (tx, rx) = oneshot::channel();
        self.submit(
            command,
            Some(Box::new(move |response| {
                let _ = tx.send(response);
            })),
            SubmitOptions {
                state,
                delay_processing: false,
            },
        );
        rx.await.unwrap_or_else(|_| Err(CommandError::aborted()))
    }

    /// Removes queued work that has not been drained yet.
    pub fn cancel(&self, ticket: &Ticket) -> bool {
        self.shared.scheduler().cancel(ticket)
    }

    /// Starts processing work queued with `delay_processing`.
    pub fn process(&self) {
        self.shared.wake.notify_one();
    }

    /// True while a unit is on the wire.
    pub fn is_busy(&self) -> bool {
        self.shared.scheduler().phase() == Phase::Busy
    }

    pub fn has_pending(&self) -> bool {
        self.shared.scheduler().has_work()
    }

    /// Sends everything already queued, then stops the driver.
    pub async fn shutdown(self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        if let Err(e) = self.driver.await {
            log::error!("command queue driver failed: {e}");
        }
    }
}

async fn drive<C: Connector>(shared: Arc<Shared>, mut connector: C) {
    loop {
        let drain = shared
            .scheduler()
            .next_unit(&connector, &shared.on_callback_error);
        for rejection in drain.rejected {
            rejection.deliver(&shared.on_callback_error);
        }
        match drain.unit {
            Some((unit, completion)) => {
                log::trace!("sending unit of {} commands", unit.items.len());
                shared.scheduler().set_phase(Phase::Busy);
                let outcome = connector.send(unit).await;
                shared.scheduler().set_phase(Phase::Idle);
                completion.complete(outcome, &shared.on_callback_error);
            }
            None => {
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                shared.wake.notified().await;
            }
        }
    }
    log::debug!("command queue driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SplitLimits;
    use crate::connector::{BatchPolicy, UnitOutcome, WireUnit};
    use prism_core::{State, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Abandons every unit without answering.
    struct Abandon;

    impl BatchPolicy for Abandon {
        fn measure(&self, _: &Command) -> Result<usize, CommandError> {
            Ok(1)
        }

        fn state_overhead(&self, _: &State) -> usize {
            0
        }

        fn limits(&self) -> SplitLimits {
            SplitLimits::default()
        }
    }

    impl Connector for Abandon {
        async fn send(&mut self, _: WireUnit) -> UnitOutcome {
            UnitOutcome::Suppressed
        }
    }

    /// Echoes each command name back and records units.
    struct Echo {
        units: mpsc::UnboundedSender<Vec<String>>,
        delay: Duration,
    }

    impl BatchPolicy for Echo {
        fn measure(&self, _: &Command) -> Result<usize, CommandError> {
            Ok(1)
        }

        fn state_overhead(&self, _: &State) -> usize {
            0
        }

        fn limits(&self) -> SplitLimits {
            SplitLimits::default()
        }
    }

    impl Connector for Echo {
        async fn send(&mut self, unit: WireUnit) -> UnitOutcome {
            tokio::time::sleep(self.delay).await;
            let names: Vec<String> = unit.items.iter().map(|i| i.command.name().to_string()).collect();
            let _ = self.units.send(names.clone());
            UnitOutcome::Delivered(names.into_iter().map(|n| Ok(Value::from(n))).collect())
        }
    }

    fn echo(delay: Duration) -> (Echo, mpsc::UnboundedReceiver<Vec<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Echo { units: tx, delay }, rx)
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (connector, _units) = echo(Duration::ZERO);
        let queue = CommandQueue::spawn(connector, State::session().into_ref());
        let result = queue.call(Command::new("ping"), None).await;
        assert_eq!(result.unwrap(), Value::from("ping"));
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_on_suppressed_unit_is_aborted() {
        let queue = CommandQueue::spawn(Abandon, State::session().into_ref());
        let err = queue.call(Command::new("ping"), None).await.unwrap_err();
        assert_eq!(err, CommandError::aborted());
        assert!(err.is_client_side());
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_work_accumulates_while_busy() {
        let (connector, mut units) = echo(Duration::from_millis(50));
        let queue = CommandQueue::spawn(connector, State::session().into_ref());

        queue.submit(Command::new("first"), None, SubmitOptions::default());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.is_busy());
        queue.submit(Command::new("a"), None, SubmitOptions::default());
        queue.submit(Command::new("b"), None, SubmitOptions::default());

        assert_eq!(units.recv().await.unwrap(), ["first"]);
        assert_eq!(units.recv().await.unwrap(), ["a", "b"]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_delayed_processing_waits_for_process() {
        let (connector, mut units) = echo(Duration::ZERO);
        let queue = CommandQueue::spawn(connector, State::session().into_ref());

        queue.submit(Command::new("a"), None, SubmitOptions::default().delayed());
        queue.submit(Command::new("b"), None, SubmitOptions::default().delayed());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(units.try_recv().is_err());
        assert!(queue.has_pending());

        queue.process();
        assert_eq!(units.recv().await.unwrap(), ["a", "b"]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue() {
        let (connector, mut units) = echo(Duration::ZERO);
        let queue = CommandQueue::spawn(connector, State::session().into_ref());
        queue.submit(Command::new("last"), None, SubmitOptions::default().delayed());
        queue.shutdown().await;
        assert_eq!(units.recv().await.unwrap(), ["last"]);
    }
}
