//! The seam between the scheduler and a transport.

use std::future::Future;

use prism_core::{Command, CommandError, Response, State, StateRef};

use crate::batch::SplitLimits;

/// Transport rules the scheduler consults while draining.
pub trait BatchPolicy {
    /// Encoded size of `command`, or the reason it cannot be sent.
    fn measure(&self, command: &Command) -> Result<usize, CommandError>;

    /// Encoded size a state adds to every request it scopes.
    fn state_overhead(&self, state: &State) -> usize;

    fn limits(&self) -> SplitLimits;

    /// Whether a producer scoped by `next` may join a batch opened under
    /// `batch`. Identity by default.
    fn compatible(&self, batch: &StateRef, next: &StateRef) -> bool {
        State::same_scope(batch, next)
    }
}

/// One command of a unit as the transport sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct WireItem {
    pub command: Command,
    /// Assigned only to commands somebody waits on.
    pub id: Option<u64>,
    /// Result is an image for a sink.
    pub render: bool,
}

/// A safe unit ready to be sent.
#[derive(Debug, Clone)]
pub struct WireUnit {
    pub state: StateRef,
    pub items: Vec<WireItem>,
}

impl WireUnit {
    pub fn needs_response(&self) -> bool {
        self.items.iter().any(|item| item.id.is_some())
    }

    pub fn ends_with_render(&self) -> bool {
        self.items.last().is_some_and(|item| item.render)
    }
}

/// How a unit ended.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    /// One response per item, in item order. Items nobody waits on carry
    /// `Ok(Null)`.
    Delivered(Vec<Response>),
    /// The whole unit failed; every waiter gets this error.
    Failed(CommandError),
    /// Deliberately abandoned. Nobody is called back.
    Suppressed,
}

/// A transport the command queue can drive.
pub trait Connector: BatchPolicy + Send + 'static {
    /// Sends one unit. Called with at most one unit outstanding.
    fn send(&mut self, unit: WireUnit) -> impl Future<Output = UnitOutcome> + Send;
}
