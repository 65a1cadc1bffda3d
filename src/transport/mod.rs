//! Wire transports carrying one XMPP stream.
//!
//! A transport hands complete parse events to the stream task and writes
//! elements back in its own framing. Both variants buffer partial input
//! internally, so `read_element` can be raced against other futures and
//! dropped without losing data.

mod compress;
pub mod socket;
pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use rustls::ServerConfig;

use crate::config::{CompressionLevel, TransportKind};
use crate::error::TransportError;
use crate::xml::{Element, ParseEvent};

pub use socket::SocketTransport;
pub use websocket::WebSocketTransport;

/// Label of the TLS exporter used as `tls-unique` channel binding data.
pub(crate) const CHANNEL_BINDING_LABEL: &[u8] = b"EXPORTER-Channel-Binding";
pub(crate) const CHANNEL_BINDING_LEN: usize = 32;

pub(crate) fn export_channel_binding(conn: &rustls::ServerConnection) -> Option<Vec<u8>> {
    conn.export_keying_material(
        vec![0u8; CHANNEL_BINDING_LEN],
        CHANNEL_BINDING_LABEL,
        None,
    )
    .ok()
}

#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    fn is_secured(&self) -> bool;

    /// Next stream-level event. EOF is reported as [`TransportError::Closed`].
    async fn read_element(&mut self) -> Result<ParseEvent, TransportError>;

    async fn write_element(&mut self, elem: &Element) -> Result<(), TransportError>;

    async fn write_str(&mut self, s: &str) -> Result<(), TransportError>;

    /// Writes the server opening root in the transport's framing.
    async fn open_stream(&mut self, from: &str, id: &str) -> Result<(), TransportError>;

    /// Writes the closing root in the transport's framing.
    async fn close_stream(&mut self) -> Result<(), TransportError>;

    /// Upgrades the connection in place and resets the parser.
    async fn start_tls(&mut self, config: Arc<ServerConfig>) -> Result<(), TransportError>;

    /// Compresses everything written and read from now on.
    fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), TransportError>;

    /// Discards parser state after a stream restart.
    fn restart(&mut self);

    fn channel_binding_bytes(&self) -> Option<Vec<u8>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}
