//! WebSocket streaming connector.
//!
//! Provides:
//! - Connection lifecycle (connect with handshake, close)
//! - Command execution with per-command results
//! - Image streams with acknowledgement, display pause and rendered handlers
//!
//! The socket is split into a writer task fed by an outgoing channel and a
//! reader task that drives [`StreamingProtocol`]. Callbacks run on the
//! reader task after the protocol lock is released.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;

use prism_core::{Command, CommandError, ImageSink, Response, State, StateRef, Value, ValueMap};

use crate::batch::SplitLimits;
use crate::callback::{log_callback_errors, CallbackErrorHandler};
use crate::clock::{Clock, SystemClock};
use crate::codec::{encode_value, ByteOrder};
use crate::config::ClientConfig;
use crate::connector::{BatchPolicy, Connector, UnitOutcome, WireUnit};
use crate::error::TransportError;
use crate::handshake::Negotiated;
use crate::stream::{FrameCallback, RenderedHandler};
use crate::streaming::{Delivery, Incoming, StreamingProtocol};

/// Request framing around the commands of a unit.
const REQUEST_OVERHEAD: usize = 96;

/// Connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Handshaking,
    Connected,
    Closed { reason: String },
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamStatus::Handshaking => write!(f, "handshaking"),
            StreamStatus::Connected => write!(f, "connected"),
            StreamStatus::Closed { reason } => write!(f, "closed: {reason}"),
        }
    }
}

/// Latest image received on any stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageArrival {
    /// Frames received since connecting.
    pub count: u64,
    pub render_loop: String,
    pub image_id: u32,
    pub statistics: ValueMap,
}

/// An execute request on the wire.
#[derive(Debug)]
pub struct PendingExecution {
    sequence_id: Option<u64>,
    results: Option<oneshot::Receiver<Result<Vec<Response>, CommandError>>>,
}

impl PendingExecution {
    /// Sequence id attached for rendered handlers.
    pub fn sequence_id(&self) -> Option<u64> {
        self.sequence_id
    }

    /// Per-command results. Empty when no results were requested.
    pub async fn results(self) -> Result<Vec<Response>, TransportError> {
        match self.results {
            Some(rx) => rx
                .await
                .map_err(|_| TransportError::ConnectionClosed)?
                .map_err(TransportError::from),
            None => Ok(Vec::new()),
        }
    }
}

struct Inner {
    protocol: Mutex<StreamingProtocol>,
    outgoing: mpsc::Sender<Message>,
    status: watch::Sender<StreamStatus>,
    arrivals: watch::Sender<ImageArrival>,
    on_callback_error: CallbackErrorHandler,
    limits: SplitLimits,
}

impl Inner {
    fn protocol(&self) -> MutexGuard<'_, StreamingProtocol> {
        self.protocol.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            delivery.run(&self.on_callback_error);
        }
    }

    async fn dispatch(&self, incoming: Incoming) {
        for frame in incoming.outgoing {
            if self.outgoing.send(Message::Binary(frame.into())).await.is_err() {
                log::debug!("writer gone, dropping outgoing frame");
            }
        }
        if let Some(frame) = &incoming.frame {
            self.arrivals.send_modify(|arrival| {
                arrival.count += 1;
                arrival.render_loop = frame.render_loop.clone();
                arrival.image_id = frame.image_id;
                arrival.statistics = frame.statistics.clone();
            });
        }
        self.run(incoming.deliveries);
    }

    fn shutdown(&self, reason: &str) {
        let deliveries = self.protocol().on_close(reason);
        if !deliveries.is_empty() {
            log::warn!("connection closed with {} pending callbacks: {reason}", deliveries.len());
        }
        self.run(deliveries);
        self.status.send_replace(StreamStatus::Closed {
            reason: reason.to_string(),
        });
    }
}

/// Streaming connection to a render server.
#[derive(Clone)]
pub struct WsConnector {
    inner: Arc<Inner>,
}

impl fmt::Debug for WsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConnector")
            .field("protocol", &*self.inner.protocol())
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl WsConnector {
    /// Connects to `config.ws_url` and completes the handshake.
    pub async fn connect(config: &ClientConfig) -> Result<Self, TransportError> {
        Self::connect_with(config, Arc::new(SystemClock), log_callback_errors()).await
    }

    pub async fn connect_with(
        config: &ClientConfig,
        clock: Arc<dyn Clock>,
        on_callback_error: CallbackErrorHandler,
    ) -> Result<Self, TransportError> {
        log::info!("connecting to {}", config.ws_url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(config.ws_url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let mut protocol = StreamingProtocol::new(clock);

        let handshake = async {
            loop {
                let Some(message) = ws_reader.next().await else {
                    return Err(TransportError::ConnectionClosed);
                };
                match message? {
                    Message::Binary(data) => {
                        let incoming = protocol.on_binary(&data)?;
                        for reply in incoming.outgoing {
                            ws_writer.send(Message::Binary(reply.into())).await?;
                        }
                        if let Some(negotiated) = incoming.started {
                            return Ok::<Negotiated, TransportError>(negotiated);
                        }
                    }
                    Message::Close(_) => return Err(TransportError::ConnectionClosed),
                    _ => {}
                }
            }
        };
        let negotiated = match tokio::time::timeout(config.handshake_timeout(), handshake).await {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(e)) => {
                log::error!("handshake with {} failed: {e}", config.ws_url);
                let _ = ws_writer.close().await;
                return Err(e);
            }
            Err(_) => {
                log::error!("handshake with {} timed out", config.ws_url);
                let _ = ws_writer.close().await;
                return Err(TransportError::Timeout("handshake"));
            }
        };
        log::debug!("negotiated {negotiated:?}");

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(config.command_channel_capacity.max(1));
        let (status, _) = watch::channel(StreamStatus::Connected);
        let (arrivals, _) = watch::channel(ImageArrival::default());
        let inner = Arc::new(Inner {
            protocol: Mutex::new(protocol),
            outgoing: out_tx,
            status,
            arrivals,
            on_callback_error,
            limits: SplitLimits {
                max_len: config.ws_max_batch_len,
            },
        });

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = ws_writer.send(message).await {
                    log::debug!("WebSocket write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Reader task: feed incoming messages to the protocol
        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let result = reader_inner.protocol().on_binary(&data);
                        match result {
                            Ok(incoming) => reader_inner.dispatch(incoming).await,
                            Err(e) => {
                                log::error!("protocol error, closing connection: {e}");
                                let _ = reader_inner.outgoing.send(Message::Close(None)).await;
                                break format!("protocol error: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "connection closed".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("WebSocket error: {e}"),
                }
            };
            reader_inner.shutdown(&reason);
        });

        Ok(Self { inner })
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.inner.protocol().negotiated()
    }

    pub fn byte_order(&self) -> Option<ByteOrder> {
        self.negotiated().map(|n| n.order)
    }

    pub fn status(&self) -> watch::Receiver<StreamStatus> {
        self.inner.status.subscribe()
    }

    pub fn arrivals(&self) -> watch::Receiver<ImageArrival> {
        self.inner.arrivals.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.protocol().is_started()
    }

    /// Sends commands, registering for results when `want_results`.
    pub async fn submit_execute(
        &self,
        commands: &[Command],
        state: Option<&State>,
        want_results: bool,
        on_rendered: Vec<RenderedHandler>,
    ) -> Result<PendingExecution, TransportError> {
        let (tx, rx) = if want_results {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let on_results = tx.map(|tx| -> crate::streaming::ResultsHandler {
            Box::new(move |results| {
                let _ = tx.send(results);
            })
        });
        let prepared = self
            .inner
            .protocol()
            .prepare_execute(commands, state, on_results, on_rendered)?;

        if self
            .inner
            .outgoing
            .send(Message::Binary(prepared.bytes.into()))
            .await
            .is_err()
        {
            let mut protocol = self.inner.protocol();
            if let Some(id) = prepared.request_id {
                protocol.forget(id);
            }
            if let (Some(seq), Some(target)) = (
                prepared.sequence_id,
                state.and_then(State::render_loop_target),
            ) {
                protocol.cancel_rendered(&target.name, seq);
            }
            return Err(TransportError::ConnectionClosed);
        }
        Ok(PendingExecution {
            sequence_id: prepared.sequence_id,
            results: rx,
        })
    }

    /// Executes commands and waits for their results.
    pub async fn execute(
        &self,
        commands: &[Command],
        state: Option<&State>,
    ) -> Result<Vec<Response>, TransportError> {
        self.submit_execute(commands, state, true, Vec::new())
            .await?
            .results()
            .await
    }

    /// Executes on a render loop. `on_rendered` runs once with the first
    /// frame that includes these commands.
    pub async fn execute_rendered(
        &self,
        commands: &[Command],
        state: &State,
        on_rendered: RenderedHandler,
    ) -> Result<PendingExecution, TransportError> {
        self.submit_execute(commands, Some(state), true, vec![on_rendered])
            .await
    }

    /// Stops rendered handlers for `sequence_id` from ever running.
    pub fn cancel_rendered(&self, render_loop: &str, sequence_id: u64) -> bool {
        self.inner.protocol().cancel_rendered(render_loop, sequence_id)
    }

    async fn expect_ok(&self, command: Command) -> Result<(), TransportError> {
        let name = command.name().to_string();
        let mut results = self.execute(std::slice::from_ref(&command), None).await?;
        match results.pop() {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e.into()),
            None => {
                log::warn!("{name}: empty response");
                Err(CommandError::missing_response().into())
            }
        }
    }

    /// Starts streaming a render loop's frames to `sink`.
    pub async fn start_stream(
        &self,
        render_loop: &str,
        sink: Arc<dyn ImageSink>,
        on_frame: Option<FrameCallback>,
    ) -> Result<(), TransportError> {
        self.inner
            .protocol()
            .start_stream(render_loop, sink, on_frame)?;
        let command = Command::new("render_loop_start_stream").param("render_loop_name", render_loop);
        if let Err(e) = self.expect_ok(command).await {
            let _ = self.inner.protocol().stop_stream(render_loop);
            return Err(e);
        }
        Ok(())
    }

    pub async fn stop_stream(&self, render_loop: &str) -> Result<(), TransportError> {
        self.inner.protocol().stop_stream(render_loop)?;
        let command = Command::new("render_loop_stop_stream").param("render_loop_name", render_loop);
        self.expect_ok(command).await
    }

    pub async fn set_stream_parameters(
        &self,
        render_loop: &str,
        params: ValueMap,
    ) -> Result<(), TransportError> {
        let command = Command::new("render_loop_set_stream_parameters")
            .param("render_loop_name", render_loop)
            .param("stream_params", params);
        self.expect_ok(command).await
    }

    /// Stops forwarding frames to the sink. Nests; returns the pause count.
    pub fn pause_display(&self, render_loop: &str) -> Result<u32, TransportError> {
        self.inner.protocol().pause_display(render_loop)
    }

    /// Undoes one pause, or all of them with `force`.
    pub fn resume_display(&self, render_loop: &str, force: bool) -> Result<u32, TransportError> {
        self.inner.protocol().resume_display(render_loop, force)
    }

    /// Asks the server to close. Pending callbacks fail once the reader sees
    /// the socket close.
    pub async fn close(&self) {
        let _ = self.inner.outgoing.send(Message::Close(None)).await;
    }
}

impl BatchPolicy for WsConnector {
    fn measure(&self, command: &Command) -> Result<usize, CommandError> {
        encode_value(&command.to_value(), ByteOrder::Little)
            .map(|bytes| bytes.len())
            .map_err(|e| CommandError::encode(format!("command {}: {e}", command.name())))
    }

    fn state_overhead(&self, state: &State) -> usize {
        let prefix: usize = state
            .prefix()
            .iter()
            .filter_map(|command| self.measure(command).ok())
            .sum();
        REQUEST_OVERHEAD + prefix
    }

    fn limits(&self) -> SplitLimits {
        self.inner.limits
    }

    fn compatible(&self, batch: &StateRef, next: &StateRef) -> bool {
        State::merges_into(batch, next)
    }
}

impl Connector for WsConnector {
    async fn send(&mut self, unit: WireUnit) -> UnitOutcome {
        let commands: Vec<Command> = unit.items.iter().map(|item| item.command.clone()).collect();
        let want_results = unit.needs_response();
        let pending = self
            .submit_execute(&commands, Some(unit.state.as_ref()), want_results, Vec::new())
            .await;
        let results = match pending {
            Ok(pending) => pending.results().await,
            Err(e) => Err(e),
        };
        match results {
            Ok(results) if want_results => UnitOutcome::Delivered(results),
            Ok(_) => UnitOutcome::Delivered(vec![Ok(Value::Null); commands.len()]),
            Err(e) => {
                log::error!("streaming unit of {} commands failed: {e}", commands.len());
                UnitOutcome::Failed(e.to_command_error())
            }
        }
    }
}
