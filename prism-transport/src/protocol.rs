//! Binary WebSocket protocol: handshake messages and frames.
//!
//! Handshake (fixed layout, no type tag):
//! ```text
//! server greeting (40 bytes)
//! ┌──────────┬────────────┬─────────┬──────────────┬──────────┐
//! │ magic    │ endianness │ version │ server clock │ nonce    │
//! │ 8 bytes  │ 4 bytes    │ u32     │ f64          │ 16 bytes │
//! └──────────┴────────────┴─────────┴──────────────┴──────────┘
//! client greeting (28 bytes): client magic, u32 version, nonce echo
//! server ack (12 bytes):      server magic, u32 version
//! ```
//!
//! After the handshake every frame starts with a u32 message type in the
//! negotiated byte order:
//! ```text
//! ┌──────────┬──────────────────────────────────────────────────┐
//! │ msg_type │ payload                                          │
//! │ 4 bytes  │ variable                                         │
//! └──────────┴──────────────────────────────────────────────────┘
//! image            u32 image id, f64 server time, typed map
//!                  {render_loop_name, image, statistics}
//! image ack        u32 image id, f64 client receive time
//! time request     f64 server time
//! time response    f64 client time
//! command          typed map {id?, commands, state?, render_loop?}
//! command response typed map {id, results}
//! debug mode       u32 flag
//! ```

use prism_core::{CancelMode, Command, CommandError, Image, Response, Value, ValueMap};

use crate::codec::{ByteOrder, CodecError, Decoder, Encoder};

pub const SERVER_MAGIC: [u8; 8] = *b"RSWSRLS\0";
pub const CLIENT_MAGIC: [u8; 8] = *b"RSWSRLC\0";
pub const GREETING_LEN: usize = 40;
pub const CLIENT_GREETING_LEN: usize = 28;
pub const ACK_LEN: usize = 12;
pub const SUPPORTED_VERSIONS: [u32; 2] = [1, 2];

const LITTLE_ENDIAN_FLAG: [u8; 4] = [1, 0, 0, 0];
const BIG_ENDIAN_FLAG: [u8; 4] = [0, 0, 0, 1];

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Image = 0x01,
    ImageAck = 0x02,
    TimeRequest = 0x03,
    TimeResponse = 0x04,
    Command = 0x05,
    CommandResponse = 0x06,
    PreferStringDebugMode = 0x07,
}

impl MessageType {
    pub fn from_u32(n: u32) -> Option<Self> {
        Some(match n {
            0x01 => MessageType::Image,
            0x02 => MessageType::ImageAck,
            0x03 => MessageType::TimeRequest,
            0x04 => MessageType::TimeResponse,
            0x05 => MessageType::Command,
            0x06 => MessageType::CommandResponse,
            0x07 => MessageType::PreferStringDebugMode,
            _ => return None,
        })
    }
}

/// Protocol errors. Any of these aborts the connection.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("expected {expected} byte handshake message, got {actual}")]
    BadLength { expected: usize, actual: usize },
    #[error("bad handshake magic {0:02x?}")]
    BadMagic([u8; 8]),
    #[error("bad endianness flag {0:02x?}")]
    BadEndianness([u8; 4]),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("handshake version mismatch: negotiated {expected}, server acknowledged {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u32),
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageType),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("message received before handshake completed")]
    NotStarted,
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

fn check_len(bytes: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if bytes.len() != expected {
        return Err(ProtocolError::BadLength {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn check_magic(bytes: &[u8], magic: &[u8; 8]) -> Result<(), ProtocolError> {
    let mut found = [0u8; 8];
    found.copy_from_slice(&bytes[..8]);
    if &found != magic {
        return Err(ProtocolError::BadMagic(found));
    }
    Ok(())
}

/// First message sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerGreeting {
    pub order: ByteOrder,
    pub version: u32,
    pub server_time: f64,
    pub nonce: [u8; 16],
}

impl ServerGreeting {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        check_len(bytes, GREETING_LEN)?;
        check_magic(bytes, &SERVER_MAGIC)?;
        let mut flag = [0u8; 4];
        flag.copy_from_slice(&bytes[8..12]);
        let order = match flag {
            LITTLE_ENDIAN_FLAG => ByteOrder::Little,
            BIG_ENDIAN_FLAG => ByteOrder::Big,
            other => return Err(ProtocolError::BadEndianness(other)),
        };
        let mut decoder = Decoder::new(&bytes[12..], order);
        let version = decoder.read_u32()?;
        let server_time = decoder.read_f64()?;
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(decoder.take(16)?);
        Ok(Self {
            order,
            version,
            server_time,
            nonce,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.order, GREETING_LEN);
        encoder.put_bytes(&SERVER_MAGIC);
        encoder.put_bytes(match self.order {
            ByteOrder::Little => &LITTLE_ENDIAN_FLAG,
            ByteOrder::Big => &BIG_ENDIAN_FLAG,
        });
        encoder.put_u32(self.version);
        encoder.put_f64(self.server_time);
        encoder.put_bytes(&self.nonce);
        encoder.finish()
    }
}

/// Client reply to the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientGreeting {
    pub version: u32,
    pub nonce: [u8; 16],
}

impl ClientGreeting {
    pub fn encode(&self, order: ByteOrder) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(order, CLIENT_GREETING_LEN);
        encoder.put_bytes(&CLIENT_MAGIC);
        encoder.put_u32(self.version);
        encoder.put_bytes(&self.nonce);
        encoder.finish()
    }

    pub fn parse(bytes: &[u8], order: ByteOrder) -> Result<Self, ProtocolError> {
        check_len(bytes, CLIENT_GREETING_LEN)?;
        check_magic(bytes, &CLIENT_MAGIC)?;
        let mut decoder = Decoder::new(&bytes[8..], order);
        let version = decoder.read_u32()?;
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(decoder.take(16)?);
        Ok(Self { version, nonce })
    }
}

/// Server acknowledgement completing the handshake.
pub fn encode_ack(order: ByteOrder, version: u32) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(order, ACK_LEN);
    encoder.put_bytes(&SERVER_MAGIC);
    encoder.put_u32(version);
    encoder.finish()
}

/// Checks the acknowledgement against the negotiated version.
pub fn check_ack(bytes: &[u8], order: ByteOrder, expected: u32) -> Result<(), ProtocolError> {
    check_len(bytes, ACK_LEN)?;
    check_magic(bytes, &SERVER_MAGIC)?;
    let actual = Decoder::new(&bytes[8..], order).read_u32()?;
    if actual != expected {
        return Err(ProtocolError::VersionMismatch { expected, actual });
    }
    Ok(())
}

/// A rendered frame pushed by a render loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub image_id: u32,
    pub server_time: f64,
    pub render_loop: String,
    pub image: Image,
    pub statistics: ValueMap,
}

impl ImageFrame {
    /// Highest edit sequence id reflected in this frame.
    pub fn sequence_id(&self) -> Option<u64> {
        self.statistics.get("sequence_id").and_then(Value::as_u64)
    }

    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, ProtocolError> {
        let image_id = decoder.read_u32()?;
        let server_time = decoder.read_f64()?;
        let body = decoder.read_value()?;
        let render_loop = body
            .get("render_loop_name")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("image frame without render_loop_name".into()))?
            .to_string();
        let image = body
            .get("image")
            .cloned()
            .and_then(Image::from_value)
            .ok_or_else(|| ProtocolError::Malformed("image frame without image data".into()))?;
        let statistics = match body.get("statistics") {
            Some(Value::Map(map)) => map.clone(),
            _ => ValueMap::new(),
        };
        Ok(Self {
            image_id,
            server_time,
            render_loop,
            image,
            statistics,
        })
    }

    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>, ProtocolError> {
        let image = match &self.image {
            Image::Encoded(binary) => Value::Binary(binary.clone()),
            Image::Canvas(canvas) => Value::Canvas(canvas.clone()),
        };
        let body = Value::map()
            .with("render_loop_name", self.render_loop.as_str())
            .with("image", image)
            .with("statistics", self.statistics.clone());
        let mut encoder = Encoder::new(order);
        encoder.put_u32(MessageType::Image as u32);
        encoder.put_u32(self.image_id);
        encoder.put_f64(self.server_time);
        encoder.write_value(&body)?;
        Ok(encoder.finish())
    }
}

/// Render-loop routing attached to a command request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderLoopRouting {
    pub name: String,
    pub cancel: CancelMode,
    pub continue_on_error: bool,
    pub sequence_id: Option<u64>,
}

/// Command request sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Present when the client wants a response.
    pub id: Option<u32>,
    pub commands: Vec<Command>,
    pub render_loop: Option<RenderLoopRouting>,
    /// Url-level parameters of the state the batch runs in.
    pub state_params: ValueMap,
}

impl CommandRequest {
    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Value::map().with(
            "commands",
            Value::Array(self.commands.iter().map(Command::to_value).collect()),
        );
        if let Some(id) = self.id {
            body = body.with("id", Value::U32(id));
        }
        if !self.state_params.is_empty() {
            body = body.with("state", self.state_params.clone());
        }
        if let Some(routing) = &self.render_loop {
            let mut block = Value::map()
                .with("name", routing.name.as_str())
                .with("cancel", routing.cancel.to_wire())
                .with("continue_on_error", routing.continue_on_error);
            if let Some(seq) = routing.sequence_id {
                block = block.with("sequence_id", Value::U64(seq));
            }
            body = body.with("render_loop", block);
        }
        let mut encoder = Encoder::new(order);
        encoder.put_u32(MessageType::Command as u32);
        encoder.write_value(&body)?;
        Ok(encoder.finish())
    }

    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, ProtocolError> {
        let body = decoder.read_value()?;
        let id = match body.get("id") {
            Some(v) => Some(
                v.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| ProtocolError::Malformed("command id is not a u32".into()))?,
            ),
            None => None,
        };
        let commands = body
            .get("commands")
            .and_then(Value::as_array)
            .ok_or_else(|| ProtocolError::Malformed("command request without commands".into()))?
            .iter()
            .map(|entry| {
                let name = entry
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProtocolError::Malformed("command without name".into()))?;
                let params = entry.get("params").and_then(Value::as_map).cloned().unwrap_or_default();
                Ok(Command::with_params(name, params))
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;
        let render_loop = body.get("render_loop").map(|block| RenderLoopRouting {
            name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            cancel: block
                .get("cancel")
                .and_then(Value::as_i64)
                .map_or(CancelMode::None, |n| CancelMode::from_wire(n as i32)),
            continue_on_error: block
                .get("continue_on_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            sequence_id: block.get("sequence_id").and_then(Value::as_u64),
        });
        let state_params = body.get("state").and_then(Value::as_map).cloned().unwrap_or_default();
        Ok(Self {
            id,
            commands,
            render_loop,
            state_params,
        })
    }
}

/// Per-command results for a request id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub id: u32,
    pub results: Vec<Response>,
}

impl CommandResponse {
    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>, ProtocolError> {
        let results = self
            .results
            .iter()
            .map(|result| match result {
                Ok(value) => Value::map().with("result", value.clone()),
                Err(error) => {
                    let mut detail = Value::map()
                        .with("code", Value::from_i64(error.code))
                        .with("message", error.message.as_str());
                    if let Some(data) = &error.data {
                        detail = detail.with("data", data.clone());
                    }
                    Value::map().with("error", detail)
                }
            })
            .collect::<Vec<_>>();
        let body = Value::map()
            .with("id", Value::U32(self.id))
            .with("results", Value::Array(results));
        let mut encoder = Encoder::new(order);
        encoder.put_u32(MessageType::CommandResponse as u32);
        encoder.write_value(&body)?;
        Ok(encoder.finish())
    }

    fn decode_body(decoder: &mut Decoder<'_>) -> Result<Self, ProtocolError> {
        let body = decoder.read_value()?;
        let id = body
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ProtocolError::Malformed("command response without id".into()))?;
        let results = body
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| ProtocolError::Malformed("command response without results".into()))?
            .iter()
            .map(parse_result)
            .collect();
        Ok(Self { id, results })
    }
}

/// `{result}` or `{error}` as sent by the server.
pub fn parse_result(entry: &Value) -> Response {
    match entry.get("error") {
        Some(error) if !error.is_null() => Err(CommandError::from_value(error)),
        _ => Ok(entry.get("result").cloned().unwrap_or(Value::Null)),
    }
}

/// Frames the server sends once started.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Image(ImageFrame),
    TimeRequest { server_time: f64 },
    CommandResponse(CommandResponse),
    PreferStringDebugMode(bool),
}

/// Frames the client sends once started.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    ImageAck { image_id: u32, received_at: f64 },
    TimeResponse { client_time: f64 },
    Command(CommandRequest),
}

fn read_type(decoder: &mut Decoder<'_>) -> Result<MessageType, ProtocolError> {
    let raw = decoder.read_u32()?;
    MessageType::from_u32(raw).ok_or(ProtocolError::UnknownMessageType(raw))
}

pub fn decode_server_frame(bytes: &[u8], order: ByteOrder) -> Result<ServerFrame, ProtocolError> {
    let mut decoder = Decoder::new(bytes, order);
    let frame = match read_type(&mut decoder)? {
        MessageType::Image => ServerFrame::Image(ImageFrame::decode_body(&mut decoder)?),
        MessageType::TimeRequest => ServerFrame::TimeRequest {
            server_time: decoder.read_f64()?,
        },
        MessageType::CommandResponse => {
            ServerFrame::CommandResponse(CommandResponse::decode_body(&mut decoder)?)
        }
        MessageType::PreferStringDebugMode => {
            ServerFrame::PreferStringDebugMode(decoder.read_u32()? != 0)
        }
        other => return Err(ProtocolError::UnexpectedMessage(other)),
    };
    Ok(frame)
}

pub fn decode_client_frame(bytes: &[u8], order: ByteOrder) -> Result<ClientFrame, ProtocolError> {
    let mut decoder = Decoder::new(bytes, order);
    let frame = match read_type(&mut decoder)? {
        MessageType::ImageAck => ClientFrame::ImageAck {
            image_id: decoder.read_u32()?,
            received_at: decoder.read_f64()?,
        },
        MessageType::TimeResponse => ClientFrame::TimeResponse {
            client_time: decoder.read_f64()?,
        },
        MessageType::Command => ClientFrame::Command(CommandRequest::decode_body(&mut decoder)?),
        other => return Err(ProtocolError::UnexpectedMessage(other)),
    };
    Ok(frame)
}

pub fn encode_image_ack(order: ByteOrder, image_id: u32, received_at: f64) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(order, 16);
    encoder.put_u32(MessageType::ImageAck as u32);
    encoder.put_u32(image_id);
    encoder.put_f64(received_at);
    encoder.finish()
}

pub fn encode_time_request(order: ByteOrder, server_time: f64) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(order, 12);
    encoder.put_u32(MessageType::TimeRequest as u32);
    encoder.put_f64(server_time);
    encoder.finish()
}

pub fn encode_time_response(order: ByteOrder, client_time: f64) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(order, 12);
    encoder.put_u32(MessageType::TimeResponse as u32);
    encoder.put_f64(client_time);
    encoder.finish()
}

pub fn encode_debug_mode(order: ByteOrder, enabled: bool) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(order, 8);
    encoder.put_u32(MessageType::PreferStringDebugMode as u32);
    encoder.put_u32(u32::from(enabled));
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::Binary;

    fn greeting(order: ByteOrder, version: u32) -> ServerGreeting {
        ServerGreeting {
            order,
            version,
            server_time: 1_700_000_000.25,
            nonce: [7; 16],
        }
    }

    #[test]
    fn test_greeting_layout() {
        let bytes = greeting(ByteOrder::Little, 2).encode();
        assert_eq!(bytes.len(), GREETING_LEN);
        assert_eq!(&bytes[..8], b"RSWSRLS\0");
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[2, 0, 0, 0]);
        assert_eq!(ServerGreeting::parse(&bytes).unwrap(), greeting(ByteOrder::Little, 2));

        let big = greeting(ByteOrder::Big, 1).encode();
        assert_eq!(&big[8..16], &[0, 0, 0, 1, 0, 0, 0, 1]);
        assert_eq!(ServerGreeting::parse(&big).unwrap().order, ByteOrder::Big);
    }

    #[test]
    fn test_greeting_rejects_garbage() {
        let mut bytes = greeting(ByteOrder::Little, 2).encode();
        assert!(matches!(
            ServerGreeting::parse(&bytes[..39]),
            Err(ProtocolError::BadLength { expected: 40, actual: 39 })
        ));
        bytes[9] = 9;
        assert!(matches!(ServerGreeting::parse(&bytes), Err(ProtocolError::BadEndianness(_))));
        bytes[0] = b'X';
        assert!(matches!(ServerGreeting::parse(&bytes), Err(ProtocolError::BadMagic(_))));
    }

    #[test]
    fn test_ack_version_checked() {
        let ack = encode_ack(ByteOrder::Big, 2);
        assert_eq!(ack.len(), ACK_LEN);
        assert!(check_ack(&ack, ByteOrder::Big, 2).is_ok());
        assert_eq!(
            check_ack(&ack, ByteOrder::Big, 1),
            Err(ProtocolError::VersionMismatch { expected: 1, actual: 2 })
        );
    }

    #[test]
    fn test_image_frame_roundtrip_and_sequence() {
        let mut statistics = ValueMap::new();
        statistics.insert("sequence_id".into(), Value::U64(12));
        statistics.insert("fps".into(), Value::F64(29.5));
        let frame = ImageFrame {
            image_id: 99,
            server_time: 12.5,
            render_loop: "main".into(),
            image: Image::Encoded(Binary::new("image/jpeg", vec![0xFF, 0xD8])),
            statistics,
        };
        let bytes = frame.encode(ByteOrder::Little).unwrap();
        match decode_server_frame(&bytes, ByteOrder::Little).unwrap() {
            ServerFrame::Image(decoded) => {
                assert_eq!(decoded, frame);
                assert_eq!(decoded.sequence_id(), Some(12));
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn test_image_frame_requires_loop_name() {
        let mut encoder = Encoder::new(ByteOrder::Little);
        encoder.put_u32(MessageType::Image as u32);
        encoder.put_u32(1);
        encoder.put_f64(0.0);
        encoder.write_value(&Value::map()).unwrap();
        assert!(matches!(
            decode_server_frame(&encoder.finish(), ByteOrder::Little),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_command_request_roundtrip() {
        let request = CommandRequest {
            id: Some(4),
            commands: vec![Command::new("element_set_attribute").param("name", "light")],
            render_loop: Some(RenderLoopRouting {
                name: "main".into(),
                cancel: CancelMode::Hard,
                continue_on_error: true,
                sequence_id: Some(3),
            }),
            state_params: ValueMap::new(),
        };
        let bytes = request.encode(ByteOrder::Big).unwrap();
        assert_eq!(
            decode_client_frame(&bytes, ByteOrder::Big).unwrap(),
            ClientFrame::Command(request)
        );
    }

    #[test]
    fn test_command_response_roundtrip() {
        let response = CommandResponse {
            id: 4,
            results: vec![
                Ok(Value::String("ok".into())),
                Err(CommandError::new(-32601, "Method not found")),
            ],
        };
        let bytes = response.encode(ByteOrder::Little).unwrap();
        assert_eq!(
            decode_server_frame(&bytes, ByteOrder::Little).unwrap(),
            ServerFrame::CommandResponse(response)
        );
    }

    #[test]
    fn test_small_frames() {
        let ack = encode_image_ack(ByteOrder::Little, 5, 1.5);
        assert_eq!(
            decode_client_frame(&ack, ByteOrder::Little).unwrap(),
            ClientFrame::ImageAck { image_id: 5, received_at: 1.5 }
        );
        let request = encode_time_request(ByteOrder::Big, 3.0);
        assert_eq!(
            decode_server_frame(&request, ByteOrder::Big).unwrap(),
            ServerFrame::TimeRequest { server_time: 3.0 }
        );
        let debug = encode_debug_mode(ByteOrder::Little, true);
        assert_eq!(
            decode_server_frame(&debug, ByteOrder::Little).unwrap(),
            ServerFrame::PreferStringDebugMode(true)
        );
    }

    #[test]
    fn test_unknown_and_misdirected_types() {
        let mut encoder = Encoder::new(ByteOrder::Little);
        encoder.put_u32(0x42);
        assert_eq!(
            decode_server_frame(&encoder.finish(), ByteOrder::Little),
            Err(ProtocolError::UnknownMessageType(0x42))
        );
        let ack = encode_image_ack(ByteOrder::Little, 1, 0.0);
        assert_eq!(
            decode_server_frame(&ack, ByteOrder::Little),
            Err(ProtocolError::UnexpectedMessage(MessageType::ImageAck))
        );
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Image as u32, 0x01);
        assert_eq!(MessageType::ImageAck as u32, 0x02);
        assert_eq!(MessageType::TimeRequest as u32, 0x03);
        assert_eq!(MessageType::TimeResponse as u32, 0x04);
        assert_eq!(MessageType::Command as u32, 0x05);
        assert_eq!(MessageType::CommandResponse as u32, 0x06);
        assert_eq!(MessageType::PreferStringDebugMode as u32, 0x07);
    }
}
