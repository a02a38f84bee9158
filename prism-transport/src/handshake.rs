//! Client side of the connection handshake.
//!
//! ```text
//! Prestart ──greeting──► Handshaking ──ack──► Started
//!     │                       │
//!     └──── any error ────────┴──────────────► Closed
//! ```

use crate::codec::ByteOrder;
use crate::protocol::{check_ack, ClientGreeting, ProtocolError, ServerGreeting, SUPPORTED_VERSIONS};

/// Parameters fixed by a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Negotiated {
    pub order: ByteOrder,
    pub version: u32,
    /// Server clock at greeting time, in seconds.
    pub server_time: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HandshakeState {
    Prestart,
    Handshaking(Negotiated),
    Started(Negotiated),
    Closed,
}

/// What the caller must do after feeding a handshake message.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeStep {
    /// Send these bytes and wait for the acknowledgement.
    Reply(Vec<u8>),
    /// Handshake complete; frames may flow.
    Started(Negotiated),
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Prestart,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        match self.state {
            HandshakeState::Started(negotiated) => Some(negotiated),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self.state, HandshakeState::Started(_))
    }

    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
    }

    /// Feeds one binary message received before the connection started.
    ///
    /// Any error closes the handshake for good.
    pub fn on_message(&mut self, bytes: &[u8]) -> Result<HandshakeStep, ProtocolError> {
        let result = self.advance(bytes);
        if result.is_err() {
            self.state = HandshakeState::Closed;
        }
        result
    }

    fn advance(&mut self, bytes: &[u8]) -> Result<HandshakeStep, ProtocolError> {
        match self.state {
            HandshakeState::Prestart => {
                let greeting = ServerGreeting::parse(bytes)?;
                if !SUPPORTED_VERSIONS.contains(&greeting.version) {
                    return Err(ProtocolError::UnsupportedVersion(greeting.version));
                }
                let negotiated = Negotiated {
                    order: greeting.order,
                    version: greeting.version,
                    server_time: greeting.server_time,
                };
                let reply = ClientGreeting {
                    version: greeting.version,
                    nonce: greeting.nonce,
                }
                .encode(greeting.order);
                log::debug!(
                    "server greeting: version {} {:?} endian",
                    greeting.version,
                    greeting.order
                );
                self.state = HandshakeState::Handshaking(negotiated);
                Ok(HandshakeStep::Reply(reply))
            }
            HandshakeState::Handshaking(negotiated) => {
                check_ack(bytes, negotiated.order, negotiated.version)?;
                self.state = HandshakeState::Started(negotiated);
                log::info!("render server connection started (protocol v{})", negotiated.version);
                Ok(HandshakeStep::Started(negotiated))
            }
            HandshakeState::Started(_) | HandshakeState::Closed => Err(ProtocolError::NotStarted),
        }
    }
}
