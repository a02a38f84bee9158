//! Batch entries and the safe-batch splitter.
//!
//! A drained batch is cut into units that can go out as one request:
//!
//! - an image command is always the last entry of its unit;
//! - an image command travels alone if anything before it expects a
//!   response, so its body can be streamed straight to the sink;
//! - the encoded length (state overhead plus entries) stays under the
//!   transport's limit, except for a single entry that is too long on its
//!   own, which is sent by itself.
//!
//! Every cut takes at least one entry, so a batch always drains.

use std::fmt;
use std::sync::Arc;

use prism_core::{Command, CommandError, ImageSink, RenderCommand, Response};

/// Receives the result of one command.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send>;

pub const DEFAULT_MAX_BATCH_LEN: usize = 2000;

/// Transport-specific size limit for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitLimits {
    pub max_len: usize,
}

impl Default for SplitLimits {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_BATCH_LEN,
        }
    }
}

pub enum EntryKind {
    Call {
        command: Command,
        callback: Option<ResponseCallback>,
    },
    Render(RenderCommand),
}

/// A command accepted into a batch, with its encoded size.
pub struct BatchEntry {
    kind: EntryKind,
    encoded_len: usize,
    id: Option<u64>,
}

impl fmt::Debug for BatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchEntry")
            .field("command", &self.command().name())
            .field("render", &self.is_render())
            .field("encoded_len", &self.encoded_len)
            .field("id", &self.id)
            .finish()
    }
}

impl BatchEntry {
    pub fn call(command: Command, callback: Option<ResponseCallback>, encoded_len: usize) -> Self {
        Self {
            kind: EntryKind::Call { command, callback },
            encoded_len,
            id: None,
        }
    }

    pub fn render(render: RenderCommand, encoded_len: usize) -> Self {
        Self {
            kind: EntryKind::Render(render),
            encoded_len,
            id: None,
        }
    }

    pub(crate) fn with_id(mut self, id: Option<u64>) -> Self {
        self.id = id;
        self
    }

    pub fn command(&self) -> &Command {
        match &self.kind {
            EntryKind::Call { command, .. } => command,
            EntryKind::Render(render) => render.command(),
        }
    }

    pub fn is_render(&self) -> bool {
        matches!(self.kind, EntryKind::Render(_))
    }

    /// Whether anyone is waiting for this entry's result.
    pub fn needs_response(&self) -> bool {
        match &self.kind {
            EntryKind::Call { callback, .. } => callback.is_some(),
            EntryKind::Render(_) => true,
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn into_kind(self) -> EntryKind {
        self.kind
    }
}

/// Number of leading entries that form the next safe unit.
///
/// `overhead` is the encoded size of everything the state adds to a
/// request: prefix commands, path and url parameters.
pub fn split_point(entries: &[BatchEntry], limits: SplitLimits, overhead: usize) -> usize {
    let mut len = overhead;
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            if len.saturating_add(entry.encoded_len) > limits.max_len {
                return i;
            }
            if entry.is_render() && entries[..i].iter().any(BatchEntry::needs_response) {
                return i;
            }
        }
        len = len.saturating_add(entry.encoded_len);
        if entry.is_render() {
            return i + 1;
        }
    }
    entries.len()
}

/// Cuts `entries` into the next safe unit and the remainder.
pub fn split(
    mut entries: Vec<BatchEntry>,
    limits: SplitLimits,
    overhead: usize,
) -> (Vec<BatchEntry>, Vec<BatchEntry>) {
    let at = split_point(&entries, limits, overhead);
    let rest = entries.split_off(at);
    (entries, rest)
}

/// A command that could not be encoded, with whoever awaits it.
pub enum Rejection {
    Callback(ResponseCallback, CommandError),
    Sink(Arc<dyn ImageSink>, CommandError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::Image;

    fn call(name: &str, len: usize, with_callback: bool) -> BatchEntry {
        let callback: Option<ResponseCallback> = if with_callback {
            Some(Box::new(|_| {}))
        } else {
            None
        };
        BatchEntry::call(Command::new(name), callback, len)
    }

    fn render(name: &str, len: usize) -> BatchEntry {
        let sink: Arc<dyn ImageSink> = Arc::new(|_: &Image| {});
        BatchEntry::render(RenderCommand::new(Command::new(name), sink), len)
    }

    fn names(entries: &[BatchEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.command().name()).collect()
    }

    fn limits(max_len: usize) -> SplitLimits {
        SplitLimits { max_len }
    }

    #[test]
    fn test_everything_fits() {
        let entries = vec![call("a", 10, true), call("b", 10, false), call("c", 10, true)];
        let (unit, rest) = split(entries, limits(100), 0);
        assert_eq!(names(&unit), ["a", "b", "c"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_render_ends_unit() {
        let entries = vec![call("a", 10, false), render("img", 10), call("b", 10, true)];
        let (unit, rest) = split(entries, limits(100), 0);
        assert_eq!(names(&unit), ["a", "img"]);
        assert_eq!(names(&rest), ["b"]);
    }

    #[test]
    fn test_render_alone_after_callbacks() {
        let entries = vec![call("a", 10, true), call("b", 10, false), render("img", 10)];
        let (unit, rest) = split(entries, limits(100), 0);
        assert_eq!(names(&unit), ["a", "b"]);
        let (unit, rest) = split(rest, limits(100), 0);
        assert_eq!(names(&unit), ["img"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_length_threshold() {
        let entries = vec![call("a", 40, true), call("b", 40, true), call("c", 40, true)];
        let (unit, rest) = split(entries, limits(100), 0);
        assert_eq!(names(&unit), ["a", "b"]);
        assert_eq!(names(&rest), ["c"]);
    }

    #[test]
    fn test_overhead_counts() {
        let entries = vec![call("a", 40, true), call("b", 40, true)];
        let (unit, rest) = split(entries, limits(100), 30);
        assert_eq!(names(&unit), ["a"]);
        assert_eq!(names(&rest), ["b"]);
    }

    #[test]
    fn test_oversized_entry_goes_alone() {
        let entries = vec![call("huge", 500, true), call("b", 10, true)];
        let (unit, rest) = split(entries, limits(100), 0);
        assert_eq!(names(&unit), ["huge"]);
        assert_eq!(names(&rest), ["b"]);

        let entries = vec![call("a", 10, true), call("huge", 500, true)];
        let (unit, rest) = split(entries, limits(100), 0);
        assert_eq!(names(&unit), ["a"]);
        assert_eq!(names(&rest), ["huge"]);
    }

    #[test]
    fn test_render_counts_toward_length() {
        let entries = vec![call("a", 60, false), render("img", 60)];
        let (unit, rest) = split(entries, limits(100), 0);
        assert_eq!(names(&unit), ["a"]);
        assert_eq!(names(&rest), ["img"]);
    }

    #[test]
    fn test_always_progresses() {
        let mut entries = vec![
            render("i1", 10),
            render("i2", 10),
            call("x", 1000, true),
            call("y", 10, true),
            render("i3", 10),
        ];
        let mut units = Vec::new();
        while !entries.is_empty() {
            let (unit, rest) = split(entries, limits(50), 5);
            assert!(!unit.is_empty());
            units.push(names(&unit).join(","));
            entries = rest;
        }
        assert_eq!(units, ["i1", "i2", "x", "y", "i3"]);
    }

    #[test]
    fn test_needs_response() {
        assert!(call("a", 1, true).needs_response());
        assert!(!call("a", 1, false).needs_response());
        assert!(render("img", 1).needs_response());
    }
}
