//! Per-render-loop image stream state.
//!
//! Each started stream owns a display pause counter and a queue of
//! rendered handlers waiting for a frame that reflects their edits.
//! Frames carry the highest sequence id they include; every waiting record
//! with a sequence id at or below it fires, in submission order.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use prism_core::ImageSink;

use crate::protocol::ImageFrame;

/// Called once with the first frame that includes the associated edit.
pub type RenderedHandler = Box<dyn FnOnce(&ImageFrame) + Send>;

/// Called with every frame shown on the stream's sink; frames dropped while paused skip it.
pub type FrameCallback = Arc<dyn Fn(&ImageFrame) + Send + Sync>;

/// Nested pause requests. `resume` undoes one `pause`; a forced resume
/// clears them all. Never goes below zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PauseCounter(u32);

impl PauseCounter {
    pub fn pause(&mut self) -> u32 {
        self.0 = self.0.saturating_add(1);
        self.0
    }

    pub fn resume(&mut self, force: bool) -> u32 {
        self.0 = if force { 0 } else { self.0.saturating_sub(1) };
        self.0
    }

    pub fn count(&self) -> u32 {
        self.0
    }

    pub fn is_paused(&self) -> bool {
        self.0 > 0
    }
}

struct PendingRender {
    sequence_id: u64,
    handlers: Vec<RenderedHandler>,
}

/// Sequence-ordered rendered handlers for one stream.
#[derive(Default)]
pub struct RenderedQueue {
    pending: VecDeque<PendingRender>,
}

impl fmt::Debug for RenderedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.pending.iter().map(|p| p.sequence_id))
            .finish()
    }
}

impl RenderedQueue {
    /// Sequence ids are handed out in increasing order, so appending keeps
    /// the queue sorted.
    pub fn push(&mut self, sequence_id: u64, handlers: Vec<RenderedHandler>) {
        debug_assert!(self.pending.back().is_none_or(|p| p.sequence_id < sequence_id));
        self.pending.push_back(PendingRender {
            sequence_id,
            handlers,
        });
    }

    /// Removes the handlers for `sequence_id`. False if they already fired.
    pub fn cancel(&mut self, sequence_id: u64) -> bool {
        match self.pending.iter().position(|p| p.sequence_id == sequence_id) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Handlers satisfied by a frame that includes edits up to `sequence_id`.
    pub fn take_through(&mut self, sequence_id: u64) -> Vec<RenderedHandler> {
        let mut ready = Vec::new();
        while self
            .pending
            .front()
            .is_some_and(|p| p.sequence_id <= sequence_id)
        {
            if let Some(record) = self.pending.pop_front() {
                ready.extend(record.handlers);
            }
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What to do with a received frame once the lock is released.
#[derive(Default)]
pub struct FrameRouting {
    /// Sink to display the frame on. `None` when paused or stale.
    pub display: Option<Arc<dyn ImageSink>>,
    pub on_frame: Option<FrameCallback>,
    pub rendered: Vec<RenderedHandler>,
}

/// A started image stream.
pub struct StreamSession {
    render_loop: String,
    sink: Arc<dyn ImageSink>,
    on_frame: Option<FrameCallback>,
    pause: PauseCounter,
    rendered: RenderedQueue,
    last_frame_time: Option<f64>,
    frames_received: u64,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("render_loop", &self.render_loop)
            .field("pause", &self.pause)
            .field("rendered", &self.rendered)
            .field("last_frame_time", &self.last_frame_time)
            .field("frames_received", &self.frames_received)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    pub fn new(
        render_loop: impl Into<String>,
        sink: Arc<dyn ImageSink>,
        on_frame: Option<FrameCallback>,
    ) -> Self {
        Self {
            render_loop: render_loop.into(),
            sink,
            on_frame,
            pause: PauseCounter::default(),
            rendered: RenderedQueue::default(),
            last_frame_time: None,
            frames_received: 0,
        }
    }

    pub fn render_loop(&self) -> &str {
        &self.render_loop
    }

    pub fn sink(&self) -> Arc<dyn ImageSink> {
        self.sink.clone()
    }

    pub fn pause(&mut self) -> u32 {
        self.pause.pause()
    }

    pub fn resume(&mut self, force: bool) -> u32 {
        self.pause.resume(force)
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn rendered(&mut self) -> &mut RenderedQueue {
        &mut self.rendered
    }

    /// Routes a frame. Rendered handlers fire even while display is
    /// paused; a frame older than the last one shown is not displayed.
    pub fn on_frame(&mut self, frame: &ImageFrame) -> FrameRouting {
        self.frames_received += 1;
        let stale = self
            .last_frame_time
            .is_some_and(|last| frame.server_time < last);
        if !stale {
            self.last_frame_time = Some(frame.server_time);
        }
        let rendered = frame
            .sequence_id()
            .map(|seq| self.rendered.take_through(seq))
            .unwrap_or_default();
        let display = if stale || self.pause.is_paused() {
            None
        } else {
            Some(self.sink.clone())
        };
        FrameRouting {
            display,
            on_frame: self.on_frame.clone(),
            rendered,
        }
    }
}

/// Started streams keyed by render loop name.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: HashMap<String, StreamSession>,
}

impl StreamTable {
    pub fn insert(&mut self, session: StreamSession) -> bool {
        if self.streams.contains_key(session.render_loop()) {
            return false;
        }
        self.streams.insert(session.render_loop().to_string(), session);
        true
    }

    pub fn remove(&mut self, render_loop: &str) -> Option<StreamSession> {
        self.streams.remove(render_loop)
    }

    pub fn get_mut(&mut self, render_loop: &str) -> Option<&mut StreamSession> {
        self.streams.get_mut(render_loop)
    }

    pub fn contains(&self, render_loop: &str) -> bool {
        self.streams.contains_key(render_loop)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = StreamSession> + '_ {
        self.streams.drain().map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
