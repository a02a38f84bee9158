//! Execution-scope descriptors.
//!
//! A [`State`] tells the server which context a batch of commands runs in.
//! Batches are grouped by descriptor *identity*: two commands share a scope
//! only if they were submitted with the same [`StateRef`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::command::Command;

/// Shared handle to a state descriptor. Compared by pointer.
pub type StateRef = Arc<State>;

/// How a render loop treats in-flight rendering when commands arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    /// Cooperative cancel, rendering is not restarted (wire value 0).
    Cooperative,
    /// Hard cancel (wire value 1).
    Hard,
    /// No cancellation.
    #[default]
    None,
}

impl CancelMode {
    pub fn from_wire(mode: i32) -> Self {
        match mode {
            0 => CancelMode::Cooperative,
            1 => CancelMode::Hard,
            _ => CancelMode::None,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            CancelMode::Cooperative => 0,
            CancelMode::Hard => 1,
            CancelMode::None => -1,
        }
    }
}

/// Render loop addressed by a render-loop state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderLoopTarget {
    pub name: String,
    pub cancel: CancelMode,
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateKind {
    /// Ordinary session scope.
    Session,
    /// Commands run interleaved with a render loop's frame production.
    RenderLoop(RenderLoopTarget),
}

#[derive(Debug, Clone, PartialEq)]
pub struct State {
    prefix: Vec<Command>,
    path: String,
    url_params: BTreeMap<String, String>,
    kind: StateKind,
}

impl Default for State {
    fn default() -> Self {
        Self::session()
    }
}

impl State {
    /// Session scope at the server root with no prefix commands.
    pub fn session() -> Self {
        Self {
            prefix: Vec::new(),
            path: String::new(),
            url_params: BTreeMap::new(),
            kind: StateKind::Session,
        }
    }

    /// Render-loop scope.
    pub fn render_loop(
        name: impl Into<String>,
        cancel: CancelMode,
        continue_on_error: bool,
    ) -> Self {
        Self {
            kind: StateKind::RenderLoop(RenderLoopTarget {
                name: name.into(),
                cancel,
                continue_on_error,
            }),
            ..Self::session()
        }
    }

    /// Appends a command that selects this scope before each batch.
    pub fn with_prefix(mut self, command: Command) -> Self {
        self.prefix.push(command);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into().trim_matches('/').to_string();
        self
    }

    pub fn with_url_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.url_params.insert(key.into(), value.into());
        self
    }

    pub fn into_ref(self) -> StateRef {
        Arc::new(self)
    }

    pub fn prefix(&self) -> &[Command] {
        &self.prefix
    }

    /// Path relative to the service base, without surrounding slashes.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn url_params(&self) -> &BTreeMap<String, String> {
        &self.url_params
    }

    pub fn kind(&self) -> &StateKind {
        &self.kind
    }

    pub fn render_loop_target(&self) -> Option<&RenderLoopTarget> {
        match &self.kind {
            StateKind::RenderLoop(target) => Some(target),
            StateKind::Session => None,
        }
    }

    /// Identity comparison.
    pub fn same_scope(a: &StateRef, b: &StateRef) -> bool {
        Arc::ptr_eq(a, b)
    }

    /// Whether `later` may join a batch opened under `earlier` on a
    /// transport that merges render-loop states.
    ///
    /// Both must address the same loop with the same error policy, carry
    /// identical prefixes and url parameters, and `later` may not request a
    /// cancel that differs from the one the batch already carries.
    pub fn merges_into(earlier: &StateRef, later: &StateRef) -> bool {
        if Self::same_scope(earlier, later) {
            return true;
        }
        let (Some(a), Some(b)) = (earlier.render_loop_target(), later.render_loop_target()) else {
            return false;
        };
        a.name == b.name
            && a.continue_on_error == b.continue_on_error
            && (b.cancel == CancelMode::None || b.cancel == a.cancel)
            && earlier.prefix == later.prefix
            && earlier.path == later.path
            && earlier.url_params == later.url_params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_not_value() {
        let a = State::session().into_ref();
        let b = State::session().into_ref();
        assert_eq!(*a, *b);
        assert!(!State::same_scope(&a, &b));
        assert!(State::same_scope(&a, &a.clone()));
    }

    #[test]
    fn test_cancel_mode_wire_values() {
        assert_eq!(CancelMode::from_wire(0), CancelMode::Cooperative);
        assert_eq!(CancelMode::from_wire(1), CancelMode::Hard);
        assert_eq!(CancelMode::from_wire(2), CancelMode::None);
        assert_eq!(CancelMode::from_wire(-1), CancelMode::None);
        assert_eq!(CancelMode::Hard.to_wire(), 1);
    }

    #[test]
    fn test_render_loop_merge_rules() {
        let base = State::render_loop("loop", CancelMode::Hard, true).into_ref();
        let no_cancel = State::render_loop("loop", CancelMode::None, true).into_ref();
        let same_cancel = State::render_loop("loop", CancelMode::Hard, true).into_ref();
        let other_cancel = State::render_loop("loop", CancelMode::Cooperative, true).into_ref();
        let other_policy = State::render_loop("loop", CancelMode::None, false).into_ref();
        let other_loop = State::render_loop("other", CancelMode::None, true).into_ref();

        assert!(State::merges_into(&base, &no_cancel));
        assert!(State::merges_into(&base, &same_cancel));
        assert!(!State::merges_into(&base, &other_cancel));
        assert!(!State::merges_into(&base, &other_policy));
        assert!(!State::merges_into(&base, &other_loop));
        // Cancel may only open a batch, never join one.
        assert!(!State::merges_into(&no_cancel, &base));
    }

    #[test]
    fn test_session_states_never_merge_by_value() {
        let a = State::session().into_ref();
        let b = State::session().into_ref();
        assert!(!State::merges_into(&a, &b));
    }

    #[test]
    fn test_path_trimmed() {
        let state = State::session().with_path("/scene/main/");
        assert_eq!(state.path(), "scene/main");
    }
}
