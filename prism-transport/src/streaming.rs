//! Connection logic for the streaming transport, without any I/O.
//!
//! [`StreamingProtocol`] is fed received binary messages and returns the
//! frames to send plus the callbacks to run. Callers run those
//! [`Delivery`] values after releasing whatever lock guards the protocol.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use prism_core::{Command, CommandError, ImageSink, Response, State, Value, ValueMap};

use crate::callback::{guarded, CallbackErrorHandler};
use crate::clock::Clock;
use crate::codec::ByteOrder;
use crate::error::TransportError;
use crate::handshake::{Handshake, HandshakeStep, Negotiated};
use crate::protocol::{
    decode_server_frame, encode_image_ack, encode_time_response, CommandRequest, ImageFrame,
    ProtocolError, RenderLoopRouting, ServerFrame,
};
use crate::stream::{FrameCallback, RenderedHandler, StreamSession, StreamTable};

/// Receives the per-command results of one request.
pub type ResultsHandler = Box<dyn FnOnce(Result<Vec<Response>, CommandError>) + Send>;

/// A callback to run outside the protocol lock.
pub enum Delivery {
    Results {
        handler: ResultsHandler,
        results: Result<Vec<Response>, CommandError>,
    },
    Display {
        sink: Arc<dyn ImageSink>,
        frame: Arc<ImageFrame>,
    },
    Frame {
        callback: FrameCallback,
        frame: Arc<ImageFrame>,
    },
    Rendered {
        handlers: Vec<RenderedHandler>,
        frame: Arc<ImageFrame>,
    },
    StreamClosed {
        sink: Arc<dyn ImageSink>,
        error: CommandError,
    },
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Results { results, .. } => f.debug_struct("Results").field("results", results).finish(),
            Delivery::Display { frame, .. } => f.debug_tuple("Display").field(&frame.image_id).finish(),
            Delivery::Frame { frame, .. } => f.debug_tuple("Frame").field(&frame.image_id).finish(),
            Delivery::Rendered { handlers, frame } => f
                .debug_struct("Rendered")
                .field("handlers", &handlers.len())
                .field("image_id", &frame.image_id)
                .finish(),
            Delivery::StreamClosed { error, .. } => f.debug_tuple("StreamClosed").field(error).finish(),
        }
    }
}

impl Delivery {
    pub fn run(self, on_error: &CallbackErrorHandler) {
        match self {
            Delivery::Results { handler, results } => {
                guarded("response", on_error, move || handler(results));
            }
            Delivery::Display { sink, frame } => {
                guarded("image sink", on_error, || sink.show(&frame.image));
            }
            Delivery::Frame { callback, frame } => {
                guarded("frame", on_error, || callback(&frame));
            }
            Delivery::Rendered { handlers, frame } => {
                for handler in handlers {
                    guarded("rendered", on_error, || handler(&frame));
                }
            }
            Delivery::StreamClosed { sink, error } => {
                guarded("image sink", on_error, || sink.failed(&error));
            }
        }
    }
}

/// Everything produced by one received message.
#[derive(Debug, Default)]
pub struct Incoming {
    pub outgoing: Vec<Vec<u8>>,
    pub deliveries: Vec<Delivery>,
    /// Set by the message that completed the handshake.
    pub started: Option<Negotiated>,
    /// The image frame carried by this message, if any.
    pub frame: Option<Arc<ImageFrame>>,
}

/// A command request ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub bytes: Vec<u8>,
    pub request_id: Option<u32>,
    pub sequence_id: Option<u64>,
}

struct Outstanding {
    handler: ResultsHandler,
    /// Results of state prefix commands, stripped before delivery.
    prefix_len: usize,
}

pub struct StreamingProtocol {
    handshake: Handshake,
    clock: Arc<dyn Clock>,
    outstanding: BTreeMap<u32, Outstanding>,
    streams: StreamTable,
    next_request_id: u32,
    next_sequence_id: u64,
    prefer_string_debug: bool,
}

impl fmt::Debug for StreamingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingProtocol")
            .field("handshake", &self.handshake)
            .field("outstanding", &self.outstanding.keys().collect::<Vec<_>>())
            .field("streams", &self.streams)
            .field("next_request_id", &self.next_request_id)
            .field("next_sequence_id", &self.next_sequence_id)
            .finish_non_exhaustive()
    }
}

fn state_block(state: &State) -> ValueMap {
    let mut block: ValueMap = state
        .url_params()
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect();
    if !state.path().is_empty() {
        block.insert("path".to_string(), Value::from(state.path()));
    }
    block
}

impl StreamingProtocol {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            handshake: Handshake::new(),
            clock,
            outstanding: BTreeMap::new(),
            streams: StreamTable::default(),
            next_request_id: 1,
            next_sequence_id: 1,
            prefer_string_debug: false,
        }
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.handshake.negotiated()
    }

    pub fn is_started(&self) -> bool {
        self.handshake.is_started()
    }

    pub fn prefers_string_debug(&self) -> bool {
        self.prefer_string_debug
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    fn order(&self) -> Result<ByteOrder, TransportError> {
        self.negotiated()
            .map(|n| n.order)
            .ok_or(TransportError::NotStarted)
    }

    fn allocate_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.checked_add(1).unwrap_or(1);
        id
    }

    /// Feeds one received binary message.
    pub fn on_binary(&mut self, bytes: &[u8]) -> Result<Incoming, ProtocolError> {
        let mut incoming = Incoming::default();
        let Some(negotiated) = self.handshake.negotiated() else {
            match self.handshake.on_message(bytes)? {
                HandshakeStep::Reply(reply) => incoming.outgoing.push(reply),
                HandshakeStep::Started(negotiated) => incoming.started = Some(negotiated),
            }
            return Ok(incoming);
        };
        let order = negotiated.order;

        match decode_server_frame(bytes, order)? {
            ServerFrame::Image(frame) => {
                incoming
                    .outgoing
                    .push(encode_image_ack(order, frame.image_id, self.clock.now()));
                let frame = Arc::new(frame);
                log::trace!(
                    "frame {} from {} ({} bytes)",
                    frame.image_id,
                    frame.render_loop,
                    frame.image.byte_len()
                );
                match self.streams.get_mut(&frame.render_loop) {
                    Some(session) => {
                        let routing = session.on_frame(&frame);
                        if let Some(sink) = routing.display {
                            incoming.deliveries.push(Delivery::Display {
                                sink,
                                frame: frame.clone(),
                            });
                            if let Some(callback) = routing.on_frame {
                                incoming.deliveries.push(Delivery::Frame {
                                    callback,
                                    frame: frame.clone(),
                                });
                            }
                        }
                        if !routing.rendered.is_empty() {
                            incoming.deliveries.push(Delivery::Rendered {
                                handlers: routing.rendered,
                                frame: frame.clone(),
                            });
                        }
                    }
                    None => log::debug!("frame for unstreamed render loop {}", frame.render_loop),
                }
                incoming.frame = Some(frame);
            }
            ServerFrame::TimeRequest { server_time } => {
                log::trace!("time request at server time {server_time}");
                incoming
                    .outgoing
                    .push(encode_time_response(order, self.clock.now()));
            }
            ServerFrame::CommandResponse(response) => match self.outstanding.remove(&response.id) {
                Some(Outstanding { handler, prefix_len }) => {
                    for (index, result) in response.results.iter().take(prefix_len).enumerate() {
                        if let Err(error) = result {
                            log::warn!("state command {index} failed: {error}");
                        }
                    }
                    let results = response.results.into_iter().skip(prefix_len).collect();
                    incoming.deliveries.push(Delivery::Results {
                        handler,
                        results: Ok(results),
                    });
                }
                None => log::warn!("response for unknown request {}", response.id),
            },
            ServerFrame::PreferStringDebugMode(enabled) => {
                log::info!("server prefers string debug mode: {enabled}");
                self.prefer_string_debug = enabled;
            }
        }
        Ok(incoming)
    }

    /// Encodes a command request.
    ///
    /// With `on_results` the request carries an id and the handler is
    /// registered until the response arrives. With rendered handlers the
    /// request carries a fresh sequence id and the handlers wait on the
    /// target loop's stream.
    pub fn prepare_execute(
        &mut self,
        commands: &[Command],
        state: Option<&State>,
        on_results: Option<ResultsHandler>,
        on_rendered: Vec<RenderedHandler>,
    ) -> Result<Prepared, TransportError> {
        let order = self.order()?;
        let target = state.and_then(State::render_loop_target);

        let sequence_id = if on_rendered.is_empty() {
            None
        } else {
            let target = target.ok_or(TransportError::NotRenderLoop)?;
            if !self.streams.contains(&target.name) {
                return Err(TransportError::NoStream(target.name.clone()));
            }
            Some(self.next_sequence_id)
        };

        let prefix = state.map(State::prefix).unwrap_or_default();
        let mut all = Vec::with_capacity(prefix.len() + commands.len());
        all.extend_from_slice(prefix);
        all.extend_from_slice(commands);

        let request_id = on_results.as_ref().map(|_| self.allocate_request_id());
        let request = CommandRequest {
            id: request_id,
            commands: all,
            render_loop: target.map(|t| RenderLoopRouting {
                name: t.name.clone(),
                cancel: t.cancel,
                continue_on_error: t.continue_on_error,
                sequence_id,
            }),
            state_params: state.map(state_block).unwrap_or_default(),
        };
        let bytes = request.encode(order)?;

        // Nothing is registered until the request is known to encode.
        if let (Some(id), Some(handler)) = (request_id, on_results) {
            self.outstanding.insert(
                id,
                Outstanding {
                    handler,
                    prefix_len: prefix.len(),
                },
            );
        }
        if let (Some(seq), Some(t)) = (sequence_id, target) {
            self.next_sequence_id += 1;
            if let Some(session) = self.streams.get_mut(&t.name) {
                session.rendered().push(seq, on_rendered);
            }
        }
        Ok(Prepared {
            bytes,
            request_id,
            sequence_id,
        })
    }

    /// Drops a registered request that never made it onto the wire.
    pub fn forget(&mut self, request_id: u32) -> bool {
        self.outstanding.remove(&request_id).is_some()
    }

    pub fn cancel_rendered(&mut self, render_loop: &str, sequence_id: u64) -> bool {
        self.streams
            .get_mut(render_loop)
            .is_some_and(|session| session.rendered().cancel(sequence_id))
    }

    pub fn start_stream(
        &mut self,
        render_loop: &str,
        sink: Arc<dyn ImageSink>,
        on_frame: Option<FrameCallback>,
    ) -> Result<(), TransportError> {
        if !self.is_started() {
            return Err(TransportError::NotStarted);
        }
        if !self
            .streams
            .insert(StreamSession::new(render_loop, sink, on_frame))
        {
            return Err(TransportError::StreamExists(render_loop.to_string()));
        }
        log::info!("stream started for render loop {render_loop}");
        Ok(())
    }

    /// Pending rendered handlers of the stream are dropped unfired.
    pub fn stop_stream(&mut self, render_loop: &str) -> Result<(), TransportError> {
        match self.streams.remove(render_loop) {
            Some(session) => {
                log::info!(
                    "stream stopped for render loop {render_loop} after {} frames",
                    session.frames_received()
                );
                Ok(())
            }
            None => Err(TransportError::NoStream(render_loop.to_string())),
        }
    }

    pub fn has_stream(&self, render_loop: &str) -> bool {
        self.streams.contains(render_loop)
    }

    pub fn pause_display(&mut self, render_loop: &str) -> Result<u32, TransportError> {
        self.streams
            .get_mut(render_loop)
            .map(StreamSession::pause)
            .ok_or_else(|| TransportError::NoStream(render_loop.to_string()))
    }

    pub fn resume_display(&mut self, render_loop: &str, force: bool) -> Result<u32, TransportError> {
        self.streams
            .get_mut(render_loop)
            .map(|session| session.resume(force))
            .ok_or_else(|| TransportError::NoStream(render_loop.to_string()))
    }

    /// Tears down after the socket closed or the protocol failed. Every
    /// outstanding request fails with a connection error, oldest first.
    pub fn on_close(&mut self, reason: &str) -> Vec<Delivery> {
        self.handshake.close();
        let error = CommandError::connection(reason);
        let mut deliveries: Vec<Delivery> = std::mem::take(&mut self.outstanding)
            .into_values()
            .map(|outstanding| Delivery::Results {
                handler: outstanding.handler,
                results: Err(error.clone()),
            })
            .collect();
        deliveries.extend(self.streams.drain().map(|session| {
            log::info!("stream for render loop {} closed", session.render_loop());
            Delivery::StreamClosed {
                sink: session.sink(),
                error: error.clone(),
            }
        }));
        deliveries
    }
}
