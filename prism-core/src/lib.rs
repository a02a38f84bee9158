//! # prism-core — value objects for the Prism render-server client
//!
//! Everything the transport moves around: typed [`Value`]s, [`Command`]s and
//! [`RenderCommand`]s, execution-scope [`State`] descriptors, and the
//! per-command [`Response`] type.

pub mod command;
pub mod error;
pub mod state;
pub mod value;

pub use command::{Command, Image, ImageSink, Params, RenderCommand};
pub use error::{CommandError, Response};
pub use state::{CancelMode, RenderLoopTarget, State, StateKind, StateRef};
pub use value::{Binary, Canvas, PixelFormat, Value, ValueError, ValueMap, MAX_SAFE_INTEGER};
