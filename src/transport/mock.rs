//! In-memory transport driving stream tasks in tests.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::ServerConfig;
use tokio::sync::mpsc;

use super::Transport;
use crate::config::{CompressionLevel, TransportKind};
use crate::error::TransportError;
use crate::xml::{Element, ParseEvent};

/// Everything the server wrote, in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Written {
    Open { from: String, id: String },
    Element(Element),
    Raw(String),
    Close,
}

pub(crate) struct MockTransport {
    kind: TransportKind,
    secured: bool,
    compressed: bool,
    inbound: mpsc::UnboundedReceiver<Result<ParseEvent, TransportError>>,
    outbound: mpsc::UnboundedSender<Written>,
}

/// Client side of a [`MockTransport`].
pub(crate) struct MockPeer {
    inbound: mpsc::UnboundedSender<Result<ParseEvent, TransportError>>,
    outbound: mpsc::UnboundedReceiver<Written>,
}

pub(crate) fn pair(kind: TransportKind, secured: bool) -> (MockTransport, MockPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        MockTransport {
            kind,
            secured,
            compressed: false,
            inbound: in_rx,
            outbound: out_tx,
        },
        MockPeer {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

impl MockPeer {
    pub(crate) fn send(&self, elem: Element) {
        let _ = self.inbound.send(Ok(ParseEvent::Element(elem)));
    }

    pub(crate) fn send_xml(&self, xml: &str) {
        let elem = crate::xml::parser::parse_element(xml).expect("test xml must be valid");
        self.send(elem);
    }

    pub(crate) fn open(&self, to: &str) {
        let root = Element::new("stream:stream")
            .attr("xmlns", crate::xml::ns::CLIENT)
            .attr("xmlns:stream", crate::xml::ns::STREAMS)
            .attr("to", to)
            .attr("version", "1.0");
        let _ = self.inbound.send(Ok(ParseEvent::StreamOpen(root)));
    }

    pub(crate) fn send_event(&self, event: Result<ParseEvent, TransportError>) {
        let _ = self.inbound.send(event);
    }

    pub(crate) async fn recv(&mut self) -> Option<Written> {
        self.outbound.recv().await
    }

    /// Next written element, skipping stream opens.
    pub(crate) async fn recv_element(&mut self) -> Element {
        loop {
            match self.outbound.recv().await {
                Some(Written::Element(elem)) => return elem,
                Some(Written::Open { .. }) => continue,
                other => panic!("expected element, got {:?}", other),
            }
        }
    }

    pub(crate) fn try_recv(&mut self) -> Option<Written> {
        self.outbound.try_recv().ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_secured(&self) -> bool {
        self.secured
    }

    async fn read_element(&mut self) -> Result<ParseEvent, TransportError> {
        match self.inbound.recv().await {
            Some(event) => event,
            None => Err(TransportError::Closed),
        }
    }

    async fn write_element(&mut self, elem: &Element) -> Result<(), TransportError> {
        self.outbound
            .send(Written::Element(elem.clone()))
            .map_err(|_| TransportError::Closed)
    }

    async fn write_str(&mut self, s: &str) -> Result<(), TransportError> {
        self.outbound
            .send(Written::Raw(s.to_string()))
            .map_err(|_| TransportError::Closed)
    }

    async fn open_stream(&mut self, from: &str, id: &str) -> Result<(), TransportError> {
        self.outbound
            .send(Written::Open {
                from: from.to_string(),
                id: id.to_string(),
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn close_stream(&mut self) -> Result<(), TransportError> {
        self.outbound
            .send(Written::Close)
            .map_err(|_| TransportError::Closed)
    }

    async fn start_tls(&mut self, _config: Arc<ServerConfig>) -> Result<(), TransportError> {
        if self.kind == TransportKind::Websocket {
            return Err(TransportError::Unsupported("starttls"));
        }
        self.secured = true;
        Ok(())
    }

    fn enable_compression(&mut self, _level: CompressionLevel) -> Result<(), TransportError> {
        if self.compressed {
            return Err(TransportError::Unsupported("nested compression"));
        }
        self.compressed = true;
        Ok(())
    }

    fn restart(&mut self) {}

    fn channel_binding_bytes(&self) -> Option<Vec<u8>> {
        self.secured.then(|| vec![7u8; 32])
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inbound.close();
        Ok(())
    }
}
