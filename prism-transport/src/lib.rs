//! # prism-transport — command transport for Prism render servers
//!
//! Orders remote commands into safe batches, sends them over HTTP or a
//! binary WebSocket, and correlates results and streamed images back to
//! their callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  producers   ┌──────────────┐   WireUnit   ┌──────────────┐
//! │ CommandQueue │ ───────────► │  Scheduler   │ ───────────► │  Connector   │
//! │ (async task) │              │ + split()    │              │ HTTP │ WS    │
//! └──────────────┘              └──────────────┘              └──────┬───────┘
//!                                                                    │
//!                     ┌──────────────────────────────────────────────┤
//!                     ▼                                              ▼
//!              ┌──────────────┐                              ┌──────────────┐
//!              │ ResultPoller │                              │ Streaming    │
//!              │ (HTTP loops) │                              │ Protocol     │
//!              └──────────────┘                              └──────┬───────┘
//!                                                                   │
//!                                                           ┌───────┴───────┐
//!                                                           │ StreamSession │
//!                                                           │ (per loop)    │
//!                                                           └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`] — Typed-value binary codec
//! - [`protocol`] — WebSocket handshake messages and frames
//! - [`batch`] — Safe-batch splitting
//! - [`scheduler`] / [`queue`] — Ordering, batching, async driving
//! - [`http`] — JSON-RPC over HTTP
//! - [`client`] — Streaming WebSocket connector
//! - [`viewer`] — Camera, stream and picking for one render loop

pub mod batch;
pub mod callback;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod handshake;
pub mod http;
pub mod poller;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod stream;
pub mod streaming;
pub mod viewer;

// Re-exports for convenience
pub use batch::{split, BatchEntry, ResponseCallback, SplitLimits, DEFAULT_MAX_BATCH_LEN};
pub use callback::{log_callback_errors, CallbackErrorHandler, CallbackPanic};
pub use client::{ImageArrival, PendingExecution, StreamStatus, WsConnector};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode_value, encode_value, ByteOrder, CodecError, Decoder, Encoder, PrecisionWarning, TypeTag};
pub use config::ClientConfig;
pub use connector::{BatchPolicy, Connector, UnitOutcome, WireItem, WireUnit};
pub use error::TransportError;
pub use handshake::{Handshake, HandshakeState, Negotiated};
pub use http::HttpConnector;
pub use poller::{PollHandle, PollStatus, ResultPoller};
pub use protocol::{ImageFrame, MessageType, ProtocolError};
pub use queue::{CommandQueue, SubmitOptions};
pub use scheduler::{BatchBuilder, Producer, Scheduler, Ticket};
pub use stream::{FrameCallback, RenderedHandler};
pub use streaming::StreamingProtocol;
pub use viewer::{PickResult, Viewer, ViewerConfig};
