//! Client-to-server listeners.
//!
//! A listener accepts TCP connections, wraps them in the configured
//! transport and runs one [`Stream`] per connection in its own task.

pub mod context;
pub mod stream;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};

use crate::config::{C2sConfig, TransportKind};
use crate::error::TransportError;
use crate::module::Hub;
use crate::router::Router;
use crate::transport::{export_channel_binding, SocketTransport, WebSocketTransport};
use crate::xml::StreamErrorKind;

pub use stream::{Services, State, Stream};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Decrements the active connection counter when the connection task ends,
/// however it ends.
struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug!(active = prev - 1, "connection closed");
    }
}

pub struct C2sServer {
    services: Services,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    active_connections: Arc<AtomicUsize>,
}

impl C2sServer {
    pub fn new(config: C2sConfig, router: Router, hub: Arc<Hub>) -> Self {
        Self {
            services: Services {
                router,
                hub,
                config: Arc::new(config),
            },
            local_addr: None,
            task: None,
            shutdown_tx: None,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.services.config.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Binds the listener and starts accepting connections.
    pub async fn start(&mut self) -> std::io::Result<SocketAddr> {
        let transport = &self.services.config.transport;
        let listener = TcpListener::bind((transport.bind_addr.as_str(), transport.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(id = %self.id(), addr = %local_addr, kind = ?transport.kind, "c2s listener started");

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        let services = self.services.clone();
        let active_connections = self.active_connections.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((tcp, addr)) = listener.accept() => {
                        let services = services.clone();
                        let counter = active_connections.clone();
                        tokio::spawn(async move {
                            let _guard = ConnectionGuard::new(counter);
                            if let Err(e) = handle_connection(tcp, addr, services).await {
                                warn!(addr = %addr, error = %e, "connection setup failed");
                            }
                        });
                    }
                    _ = shutdown_rx.recv() => {
                        info!("c2s listener shutting down");
                        break;
                    }
                }
            }
        });

        self.task = Some(task);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stops accepting and closes every stream of this listener with
    /// `system-shutdown`.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let prefix = format!("c2s:{}:", self.id());
        let mut closed = 0;
        for stream in self.services.router.registry().all_streams() {
            if stream.id().starts_with(&prefix) {
                stream.disconnect(Some(StreamErrorKind::SystemShutdown));
                closed += 1;
            }
        }
        self.local_addr = None;
        info!(id = %self.id(), streams = closed, "c2s listener stopped");
    }
}

async fn handle_connection(
    tcp: TcpStream,
    addr: SocketAddr,
    services: Services,
) -> Result<(), TransportError> {
    let id = format!(
        "c2s:{}:{}",
        services.config.id,
        NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
    );
    let transport = &services.config.transport;
    let max_stanza_size = transport.max_stanza_size;
    info!(stream_id = %id, addr = %addr, "connection accepted");

    match transport.kind {
        TransportKind::Socket => {
            if let Err(e) = tcp.set_nodelay(true) {
                debug!(stream_id = %id, error = %e, "failed to set TCP_NODELAY");
            }
            let transport = SocketTransport::new(tcp, max_stanza_size);
            Stream::new(id, transport, services).run().await;
        }
        TransportKind::Websocket if transport.tls => {
            let Some(tls) = services.router.hosts().default_tls_config() else {
                return Err(TransportError::Tls("no certificate configured".to_string()));
            };
            let tls = TlsAcceptor::from(tls).accept(tcp).await?;
            let channel_binding = export_channel_binding(tls.get_ref().1);
            let ws = accept_async(tls).await?;
            let transport = WebSocketTransport::new(ws, true, channel_binding, max_stanza_size);
            Stream::new(id, transport, services).run().await;
        }
        TransportKind::Websocket => {
            let ws = accept_async(tcp).await?;
            let transport = WebSocketTransport::new(ws, false, None, max_stanza_size);
            Stream::new(id, transport, services).run().await;
        }
    }
    Ok(())
}
