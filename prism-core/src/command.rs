//! Immutable descriptions of remote calls.

use std::fmt;
use std::sync::Arc;

use crate::error::CommandError;
use crate::value::{Binary, Canvas, Value, ValueMap};

/// Command parameters, keyed by name. Encoded in key order.
pub type Params = ValueMap;

/// A named, parameterized remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    params: Params,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Params::new(),
        }
    }

    pub fn with_params(name: impl Into<String>, params: Params) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Adds a parameter while the command is still being built.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Parameters as a JSON object, for the HTTP transport.
    pub fn params_json(&self) -> Result<serde_json::Value, CommandError> {
        let mut object = serde_json::Map::with_capacity(self.params.len());
        for (key, value) in &self.params {
            let json = value.to_json().map_err(|e| {
                CommandError::encode(format!(
                    "command {}: parameter {key}: {e}",
                    self.name
                ))
            })?;
            object.insert(key.clone(), json);
        }
        Ok(serde_json::Value::Object(object))
    }

    /// `{name, params}` map as sent over the binary transport.
    pub fn to_value(&self) -> Value {
        Value::map()
            .with("name", self.name.as_str())
            .with("params", self.params.clone())
    }
}

/// Rendered image as delivered to a sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Image {
    /// Compressed image bytes (png, jpg, ...).
    Encoded(Binary),
    /// Raw pixel buffer.
    Canvas(Canvas),
}

impl Image {
    /// Extracts an image from a result value, if it carries one.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Binary(binary) => Some(Image::Encoded(binary)),
            Value::Canvas(canvas) => Some(Image::Canvas(canvas)),
            _ => None,
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            Image::Encoded(binary) => binary.data.len(),
            Image::Canvas(canvas) => canvas.layers().iter().map(Vec::len).sum(),
        }
    }
}

/// Receives images produced by render commands or image streams.
pub trait ImageSink: Send + Sync {
    fn show(&self, image: &Image);

    fn failed(&self, error: &CommandError) {
        log::warn!("image not delivered: {error}");
    }
}

impl<F> ImageSink for F
where
    F: Fn(&Image) + Send + Sync,
{
    fn show(&self, image: &Image) {
        self(image)
    }
}

/// A command whose result is an image, routed to `sink` instead of a callback.
#[derive(Clone)]
pub struct RenderCommand {
    command: Command,
    sink: Arc<dyn ImageSink>,
}

impl RenderCommand {
    pub fn new(command: Command, sink: Arc<dyn ImageSink>) -> Self {
        Self { command, sink }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn sink(&self) -> &Arc<dyn ImageSink> {
        &self.sink
    }
}

impl fmt::Debug for RenderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderCommand")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}
