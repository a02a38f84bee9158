//! Command scheduling.
//!
//! Work is queued as *producers*: closures that add commands to a batch
//! when the scheduler drains. Plain submissions are wrapped in a
//! one-shot producer. A drain pass runs queued producers in registration
//! order, including producers registered while the pass is running, and
//! stops early when
//!
//! - the batch holds an image command, or
//! - the next producer's state cannot join the batch's state.
//!
//! The batch is then cut by [`crate::batch::split`] and the first unit is
//! handed to the transport. A remainder is sent before anything new is
//! drained.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use prism_core::{Command, CommandError, Image, ImageSink, RenderCommand, Response, State, StateRef};

use crate::batch::{split, BatchEntry, EntryKind, Rejection, ResponseCallback};
use crate::callback::{guarded, CallbackErrorHandler};
use crate::connector::{BatchPolicy, UnitOutcome, WireItem, WireUnit};

/// Adds commands to the batch being drained.
pub type Producer = Arc<dyn Fn(&mut BatchBuilder<'_>) + Send + Sync>;

struct Queued {
    producer: Producer,
    state: StateRef,
}

/// Handed to producers during a drain pass.
pub struct BatchBuilder<'a> {
    policy: &'a dyn BatchPolicy,
    state: &'a StateRef,
    entries: &'a mut Vec<BatchEntry>,
    rejected: &'a mut Vec<Rejection>,
    spawned: &'a mut Vec<Queued>,
    next_id: &'a mut u64,
}

impl BatchBuilder<'_> {
    /// State of the producer being run.
    pub fn state(&self) -> &StateRef {
        self.state
    }

    /// Entries in the batch so far, from all producers of this pass.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = *self.next_id;
        *self.next_id += 1;
        id
    }

    /// Adds a command. A command that cannot be encoded never reaches the
    /// batch; its callback gets the encode error instead.
    pub fn add_command(&mut self, command: Command, callback: Option<ResponseCallback>) {
        match self.policy.measure(&command) {
            Ok(len) => {
                let id = callback.is_some().then(|| self.allocate_id());
                self.entries
                    .push(BatchEntry::call(command, callback, len).with_id(id));
            }
            Err(error) => {
                log::warn!("dropping command {}: {error}", command.name());
                if let Some(callback) = callback {
                    self.rejected.push(Rejection::Callback(callback, error));
                }
            }
        }
    }

    pub fn call<F>(&mut self, command: Command, callback: F)
    where
        F: FnOnce(Response) + Send + 'static,
    {
        self.add_command(command, Some(Box::new(callback)));
    }

    /// Adds an image command. Nothing after it joins this unit.
    pub fn add_render(&mut self, render: RenderCommand) {
        match self.policy.measure(render.command()) {
            Ok(len) => {
                let id = self.allocate_id();
                self.entries.push(BatchEntry::render(render, len).with_id(Some(id)));
            }
            Err(error) => {
                log::warn!("dropping render command {}: {error}", render.command().name());
                self.rejected
                    .push(Rejection::Sink(render.sink().clone(), error));
            }
        }
    }

    /// Queues another producer under the current state. It runs later in
    /// this pass unless the pass stops first.
    pub fn add_producer(&mut self, producer: Producer) {
        self.add_producer_with_state(producer, self.state.clone());
    }

    pub fn add_producer_with_state(&mut self, producer: Producer, state: StateRef) {
        self.spawned.push(Queued { producer, state });
    }
}

/// Handle for cancelling queued work.
#[derive(Clone)]
pub struct Ticket(Producer);

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ticket").field(&Arc::as_ptr(&self.0)).finish()
    }
}

impl Ticket {
    pub fn producer(&self) -> &Producer {
        &self.0
    }
}

/// Whether a unit is on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Busy,
}

enum Target {
    Discard,
    Callback(ResponseCallback),
    Sink(Arc<dyn ImageSink>),
}

/// Delivers a sent unit's results to whoever is waiting on them.
pub struct Completion {
    targets: Vec<Target>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("targets", &self.targets.len())
            .finish()
    }
}

fn deliver_image(sink: &Arc<dyn ImageSink>, response: Response) {
    match response {
        Ok(value) => match Image::from_value(value) {
            Some(image) => sink.show(&image),
            None => sink.failed(&CommandError::missing_response()),
        },
        Err(error) => sink.failed(&error),
    }
}

impl Completion {
    pub fn complete(self, outcome: UnitOutcome, on_error: &CallbackErrorHandler) {
        match outcome {
            UnitOutcome::Delivered(responses) => {
                let mut responses = responses.into_iter();
                for target in self.targets {
                    let response = responses
                        .next()
                        .unwrap_or_else(|| Err(CommandError::missing_response()));
                    Self::deliver(target, response, on_error);
                }
            }
            UnitOutcome::Failed(error) => {
                for target in self.targets {
                    Self::deliver(target, Err(error.clone()), on_error);
                }
            }
            UnitOutcome::Suppressed => {
                log::debug!("suppressing {} callbacks", self.targets.len());
            }
        }
    }

    fn deliver(target: Target, response: Response, on_error: &CallbackErrorHandler) {
        match target {
            Target::Discard => {
                if let Err(error) = response {
                    log::debug!("command without callback failed: {error}");
                }
            }
            Target::Callback(callback) => {
                guarded("response", on_error, move || callback(response));
            }
            Target::Sink(sink) => {
                guarded("image sink", on_error, move || deliver_image(&sink, response));
            }
        }
    }
}

impl Rejection {
    pub fn deliver(self, on_error: &CallbackErrorHandler) {
        match self {
            Rejection::Callback(callback, error) => {
                guarded("response", on_error, move || callback(Err(error)));
            }
            Rejection::Sink(sink, error) => {
                guarded("image sink", on_error, move || sink.failed(&error));
            }
        }
    }
}

/// Result of a drain pass.
#[derive(Default)]
pub struct Drain {
    pub unit: Option<(WireUnit, Completion)>,
    /// Commands that failed to encode, to be answered before sending.
    pub rejected: Vec<Rejection>,
}

struct Carry {
    state: StateRef,
    entries: Vec<BatchEntry>,
}

/// Producer queue and batch assembly. Performs no I/O.
pub struct Scheduler {
    queue: VecDeque<Queued>,
    carry: Option<Carry>,
    default_state: StateRef,
    next_id: u64,
    phase: Phase,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queued", &self.queue.len())
            .field("carried", &self.carry.as_ref().map(|c| c.entries.len()))
            .field("next_id", &self.next_id)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(State::session().into_ref())
    }
}

impl Scheduler {
    pub fn new(default_state: StateRef) -> Self {
        Self {
            queue: VecDeque::new(),
            carry: None,
            default_state,
            next_id: 1,
            phase: Phase::Idle,
        }
    }

    pub fn default_state(&self) -> &StateRef {
        &self.default_state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Queued producers plus carried-over entries.
    pub fn has_work(&self) -> bool {
        !self.queue.is_empty() || self.carry.is_some()
    }

    /// Queues a producer. A producer that is already queued stays where it
    /// is, with its original state.
    pub fn enqueue(&mut self, producer: Producer, state: Option<StateRef>) -> Ticket {
        let state = state.unwrap_or_else(|| self.default_state.clone());
        self.push_unique(Queued {
            producer: producer.clone(),
            state,
        });
        Ticket(producer)
    }

    fn push_unique(&mut self, queued: Queued) {
        if self
            .queue
            .iter()
            .any(|q| Arc::ptr_eq(&q.producer, &queued.producer))
        {
            return;
        }
        self.queue.push_back(queued);
    }

    /// Queues a single command.
    pub fn submit(
        &mut self,
        command: Command,
        callback: Option<ResponseCallback>,
        state: Option<StateRef>,
    ) -> Ticket {
        let slot = Mutex::new(Some((command, callback)));
        let producer: Producer = Arc::new(move |batch: &mut BatchBuilder<'_>| {
            let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some((command, callback)) = taken {
                batch.add_command(command, callback);
            }
        });
        self.enqueue(producer, state)
    }

    /// Queues a single image command.
    pub fn submit_render(&mut self, render: RenderCommand, state: Option<StateRef>) -> Ticket {
        let slot = Mutex::new(Some(render));
        let producer: Producer = Arc::new(move |batch: &mut BatchBuilder<'_>| {
            let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(render) = taken {
                batch.add_render(render);
            }
        });
        self.enqueue(producer, state)
    }

    /// Removes a producer that has not been drained yet.
    pub fn cancel(&mut self, ticket: &Ticket) -> bool {
        let before = self.queue.len();
        self.queue
            .retain(|queued| !Arc::ptr_eq(&queued.producer, &ticket.0));
        self.queue.len() != before
    }

    /// Assembles the next unit to send, if there is any work.
    pub fn next_unit(&mut self, policy: &dyn BatchPolicy, on_error: &CallbackErrorHandler) -> Drain {
        let mut drain = Drain::default();
        let carry = match self.carry.take() {
            Some(carry) => Some(carry),
            None => self.drain_producers(policy, on_error, &mut drain.rejected),
        };
        let Some(Carry { state, entries }) = carry else {
            return drain;
        };

        let overhead = policy.state_overhead(&state);
        let (unit, rest) = split(entries, policy.limits(), overhead);
        if !rest.is_empty() {
            log::debug!("unit of {} commands, {} carried over", unit.len(), rest.len());
            self.carry = Some(Carry {
                state: state.clone(),
                entries: rest,
            });
        }

        let mut items = Vec::with_capacity(unit.len());
        let mut targets = Vec::with_capacity(unit.len());
        for entry in unit {
            let id = entry.id();
            match entry.into_kind() {
                EntryKind::Call { command, callback } => {
                    items.push(WireItem {
                        command,
                        id,
                        render: false,
                    });
                    targets.push(callback.map_or(Target::Discard, Target::Callback));
                }
                EntryKind::Render(render) => {
                    items.push(WireItem {
                        command: render.command().clone(),
                        id,
                        render: true,
                    });
                    targets.push(Target::Sink(render.sink().clone()));
                }
            }
        }
        drain.unit = Some((WireUnit { state, items }, Completion { targets }));
        drain
    }

    fn drain_producers(
        &mut self,
        policy: &dyn BatchPolicy,
        on_error: &CallbackErrorHandler,
        rejected: &mut Vec<Rejection>,
    ) -> Option<Carry> {
        let mut entries: Vec<BatchEntry> = Vec::new();
        let mut batch_state: Option<StateRef> = None;

        while let Some(front) = self.queue.front() {
            if let Some(state) = &batch_state {
                if entries.iter().any(BatchEntry::is_render) {
                    break;
                }
                if !policy.compatible(state, &front.state) {
                    break;
                }
            }
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            let state = batch_state.clone().unwrap_or_else(|| queued.state.clone());

            let mut spawned = Vec::new();
            {
                let mut builder = BatchBuilder {
                    policy,
                    state: &queued.state,
                    entries: &mut entries,
                    rejected: &mut *rejected,
                    spawned: &mut spawned,
                    next_id: &mut self.next_id,
                };
                guarded("producer", on_error, || (queued.producer)(&mut builder));
            }
            for queued in spawned {
                self.push_unique(queued);
            }

            // A producer that added nothing does not pin the batch state.
            batch_state = if entries.is_empty() { None } else { Some(state) };
        }

        batch_state.map(|state| Carry { state, entries })
    }
}
