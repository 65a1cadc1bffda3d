//! RFC 7395 XMPP over WebSocket.
//!
//! Each text frame carries exactly one element, so frames are parsed on
//! their own. TLS is decided when the connection is accepted (`wss`); there
//! is no in-band STARTTLS nor compression.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::Transport;
use crate::config::{CompressionLevel, TransportKind};
use crate::error::TransportError;
use crate::xml::framing::{framed_close, framed_open, is_framed_close, to_framed};
use crate::xml::parser::parse_element;
use crate::xml::{Element, ParseError, ParseEvent};

pub struct WebSocketTransport<S> {
    ws: WebSocketStream<S>,
    secured: bool,
    channel_binding: Option<Vec<u8>>,
    max_stanza_size: usize,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an accepted WebSocket. `channel_binding` is the exporter data of
    /// the TLS session underneath, if any.
    pub fn new(
        ws: WebSocketStream<S>,
        secured: bool,
        channel_binding: Option<Vec<u8>>,
        max_stanza_size: usize,
    ) -> Self {
        Self {
            ws,
            secured,
            channel_binding,
            max_stanza_size,
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn is_secured(&self) -> bool {
        self.secured
    }

    async fn read_element(&mut self) -> Result<ParseEvent, TransportError> {
        loop {
            let text = match self.ws.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => {
                    debug!("ignoring non-text frame");
                    continue;
                }
                Some(Err(e)) => return Err(e.into()),
            };
            if self.max_stanza_size > 0 && text.len() > self.max_stanza_size {
                return Err(ParseError::TooLargeStanza(self.max_stanza_size).into());
            }
            if text.trim().is_empty() {
                continue;
            }
            let elem = parse_element(&text)?;
            if is_framed_close(&elem) {
                return Ok(ParseEvent::StreamClosed);
            }
            if elem.name() == "open" || elem.name() == "stream:stream" {
                return Ok(ParseEvent::StreamOpen(elem));
            }
            return Ok(ParseEvent::Element(elem));
        }
    }

    async fn write_element(&mut self, elem: &Element) -> Result<(), TransportError> {
        let xml = to_framed(elem).to_xml();
        self.send_text(xml).await
    }

    async fn write_str(&mut self, s: &str) -> Result<(), TransportError> {
        self.send_text(s.to_string()).await
    }

    async fn open_stream(&mut self, from: &str, id: &str) -> Result<(), TransportError> {
        self.send_text(framed_open(from, id).to_xml()).await
    }

    async fn close_stream(&mut self) -> Result<(), TransportError> {
        self.send_text(framed_close().to_xml()).await
    }

    async fn start_tls(&mut self, _config: Arc<ServerConfig>) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("starttls"))
    }

    fn enable_compression(&mut self, _level: CompressionLevel) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("compression"))
    }

    fn restart(&mut self) {}

    fn channel_binding_bytes(&self) -> Option<Vec<u8>> {
        self.channel_binding.clone()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.ws.close(None).await {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
