use crate::value::Value;

/// Client-side: the command could not be encoded for the active transport.
pub const ENCODE_ERROR: i64 = -32001;
/// Client-side: the transport failed or is not connected.
pub const CONNECTION_ERROR: i64 = -32002;
/// Client-side: the request was aborted before a result arrived.
pub const ABORTED: i64 = -32003;
/// Client-side: the server answered, but not for this command.
pub const MISSING_RESPONSE: i64 = -32004;

/// Error result of a single command.
///
/// Server-reported errors carry the server's code; client-synthesized errors
/// use the constants above.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct CommandError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl CommandError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn encode(message: impl Into<String>) -> Self {
        Self::new(ENCODE_ERROR, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(CONNECTION_ERROR, message)
    }

    pub fn aborted() -> Self {
        Self::new(ABORTED, "request aborted")
    }

    pub fn missing_response() -> Self {
        Self::new(MISSING_RESPONSE, "no response for command")
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// True for errors synthesized on this side of the wire.
    pub fn is_client_side(&self) -> bool {
        matches!(
            self.code,
            ENCODE_ERROR | CONNECTION_ERROR | ABORTED | MISSING_RESPONSE
        )
    }

    /// Parses `{code, message, data?}` as sent by the server.
    pub fn from_value(value: &Value) -> Self {
        let code = value.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown server error");
        let error = Self::new(code, message);
        match value.get("data") {
            Some(data) if !data.is_null() => error.with_data(data.clone()),
            _ => error,
        }
    }
}

/// Outcome of one command.
pub type Response = Result<Value, CommandError>;
