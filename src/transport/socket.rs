//! Plain TCP transport with in-band STARTTLS and zlib compression.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use super::compress::ZlibCodec;
use super::{export_channel_binding, Transport};
use crate::config::{CompressionLevel, TransportKind};
use crate::error::TransportError;
use crate::xml::framing::{stream_open_tag, STREAM_CLOSE};
use crate::xml::{Element, ParseEvent, Parser};

const READ_BUFFER_SIZE: usize = 8192;

enum Conn {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Connection lost during a failed upgrade or after `close`.
    Gone,
}

pub struct SocketTransport {
    conn: Conn,
    parser: Parser,
    codec: Option<ZlibCodec>,
    read_buf: Box<[u8]>,
    max_stanza_size: usize,
}

impl SocketTransport {
    pub fn new(stream: TcpStream, max_stanza_size: usize) -> Self {
        Self {
            conn: Conn::Plain(stream),
            parser: Parser::new(max_stanza_size),
            codec: None,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            max_stanza_size,
        }
    }

    async fn read_raw(&mut self) -> Result<usize, TransportError> {
        let n = match &mut self.conn {
            Conn::Plain(s) => s.read(&mut self.read_buf).await?,
            Conn::Tls(s) => s.read(&mut self.read_buf).await?,
            Conn::Gone => 0,
        };
        Ok(n)
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let data = match self.codec.as_mut() {
            Some(codec) => std::borrow::Cow::Owned(codec.deflate(bytes)?),
            None => std::borrow::Cow::Borrowed(bytes),
        };
        match &mut self.conn {
            Conn::Plain(s) => {
                s.write_all(&data).await?;
                s.flush().await?;
            }
            Conn::Tls(s) => {
                s.write_all(&data).await?;
                s.flush().await?;
            }
            Conn::Gone => return Err(TransportError::Closed),
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn is_secured(&self) -> bool {
        matches!(self.conn, Conn::Tls(_))
    }

    async fn read_element(&mut self) -> Result<ParseEvent, TransportError> {
        loop {
            if let Some(event) = self.parser.next_event()? {
                return Ok(event);
            }
            let n = self.read_raw().await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            match self.codec.as_mut() {
                Some(codec) => {
                    let inflated = codec.inflate(&self.read_buf[..n], self.max_stanza_size)?;
                    self.parser.feed(&inflated);
                }
                None => self.parser.feed(&self.read_buf[..n]),
            }
        }
    }

    async fn write_element(&mut self, elem: &Element) -> Result<(), TransportError> {
        self.write_raw(elem.to_xml().as_bytes()).await
    }

    async fn write_str(&mut self, s: &str) -> Result<(), TransportError> {
        self.write_raw(s.as_bytes()).await
    }

    async fn open_stream(&mut self, from: &str, id: &str) -> Result<(), TransportError> {
        self.write_raw(stream_open_tag(from, id).as_bytes()).await
    }

    async fn close_stream(&mut self) -> Result<(), TransportError> {
        self.write_raw(STREAM_CLOSE.as_bytes()).await
    }

    async fn start_tls(&mut self, config: Arc<ServerConfig>) -> Result<(), TransportError> {
        let tcp = match std::mem::replace(&mut self.conn, Conn::Gone) {
            Conn::Plain(tcp) => tcp,
            other => {
                self.conn = other;
                return Err(TransportError::Unsupported("nested tls"));
            }
        };
        let tls = TlsAcceptor::from(config)
            .accept(tcp)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!(
            protocol = ?tls.get_ref().1.protocol_version(),
            "tls session established"
        );
        self.conn = Conn::Tls(Box::new(tls));
        self.parser.reset();
        Ok(())
    }

    fn enable_compression(&mut self, level: CompressionLevel) -> Result<(), TransportError> {
        if self.codec.is_some() {
            return Err(TransportError::Unsupported("nested compression"));
        }
        self.codec = Some(ZlibCodec::new(level.to_flate2()));
        Ok(())
    }

    fn restart(&mut self) {
        self.parser.reset();
    }

    fn channel_binding_bytes(&self) -> Option<Vec<u8>> {
        match &self.conn {
            Conn::Tls(tls) => export_channel_binding(tls.get_ref().1),
            _ => None,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match std::mem::replace(&mut self.conn, Conn::Gone) {
            Conn::Plain(mut s) => s.shutdown().await?,
            Conn::Tls(mut s) => s.shutdown().await?,
            Conn::Gone => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (SocketTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (SocketTransport::new(server, 1024), client)
    }

    #[tokio::test]
    async fn test_reads_stream_open_and_stanzas() {
        let (mut transport, mut client) = connected_pair().await;
        client
            .write_all(
                b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
                  xmlns:stream='http://etherx.jabber.org/streams' to='jackal.im' version='1.0'>",
            )
            .await
            .unwrap();

        match transport.read_element().await.unwrap() {
            ParseEvent::StreamOpen(root) => assert_eq!(root.attr_str("to"), "jackal.im"),
            other => panic!("unexpected event {:?}", other),
        }

        // Split across writes.
        client.write_all(b"<presence><prio").await.unwrap();
        client.write_all(b"rity>5</priority></presence>").await.unwrap();
        match transport.read_element().await.unwrap() {
            ParseEvent::Element(elem) => {
                assert_eq!(elem.name(), "presence");
                assert_eq!(elem.find("priority").unwrap().get_text(), "5");
            }
            other => panic!("unexpected event {:?}", other),
        }

        client.write_all(b"</stream:stream>").await.unwrap();
        assert_eq!(transport.read_element().await.unwrap(), ParseEvent::StreamClosed);
    }

    #[tokio::test]
    async fn test_oversized_stanza() {
        let (mut transport, mut client) = connected_pair().await;
        let big = format!("<message><body>{}</body></message>", "x".repeat(2048));
        client.write_all(big.as_bytes()).await.unwrap();
        assert!(matches!(
            transport.read_element().await,
            Err(TransportError::Parse(crate::xml::ParseError::TooLargeStanza(1024)))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let (mut transport, client) = connected_pair().await;
        drop(client);
        assert!(matches!(
            transport.read_element().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_writes_open_tag_and_elements() {
        let (mut transport, mut client) = connected_pair().await;
        transport.open_stream("jackal.im", "s1").await.unwrap();
        transport
            .write_element(&Element::new("stream:features"))
            .await
            .unwrap();
        transport.close_stream().await.unwrap();
        transport.close().await.unwrap();

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert!(received.starts_with("<?xml version='1.0'?><stream:stream "));
        assert!(received.contains("<stream:features/>"));
        assert!(received.ends_with("</stream:stream>"));
        assert!(!transport.is_secured());
        assert!(transport.channel_binding_bytes().is_none());
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let (mut transport, mut client) = connected_pair().await;
        transport
            .enable_compression(CompressionLevel::Default)
            .unwrap();
        let mut peer = ZlibCodec::new(flate2::Compression::default());

        let packed = peer.deflate(b"<iq id='1' type='get'><ping xmlns='urn:xmpp:ping'/></iq>").unwrap();
        client.write_all(&packed).await.unwrap();
        match transport.read_element().await.unwrap() {
            ParseEvent::Element(elem) => assert_eq!(elem.id(), "1"),
            other => panic!("unexpected event {:?}", other),
        }

        transport
            .write_element(&Element::new("iq").attr("id", "1").attr("type", "result"))
            .await
            .unwrap();
        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(
            peer.inflate(&buf[..n], 1024).unwrap(),
            br#"<iq id="1" type="result"/>"#
        );
        assert!(transport.enable_compression(CompressionLevel::Best).is_err());
    }

    #[tokio::test]
    async fn test_compressed_expansion_is_policy_limited() {
        let (mut transport, mut client) = connected_pair().await;
        transport
            .enable_compression(CompressionLevel::Default)
            .unwrap();
        let mut peer = ZlibCodec::new(flate2::Compression::best());
        let body = "x".repeat(256 * 1024);
        let packed = peer
            .deflate(format!("<message><body>{body}</body></message>").as_bytes())
            .unwrap();
        assert!(packed.len() < 8192);
        client.write_all(&packed).await.unwrap();
        assert!(matches!(
            transport.read_element().await,
            Err(TransportError::Parse(crate::xml::ParseError::TooLargeStanza(1024)))
        ));
    }
}
