//! Error types shared across layers.

use std::path::PathBuf;

use thiserror::Error;

use crate::xml::{ParseError, StanzaErrorCondition};

/// Repository and cache failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Wire-level failures reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("compression error: {0}")]
    Compression(String),
    /// Clean EOF from the peer.
    #[error("connection closed")]
    Closed,
    #[error("stream closed by peer")]
    StreamClosedByPeer,
    #[error("read timed out")]
    Timeout,
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(e))
    }
}

/// Router and C2S registry outcomes that are not deliveries.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("account does not exist")]
    NotExistingAccount,
    #[error("no available resource")]
    NotAuthenticated,
    #[error("resource not found")]
    ResourceNotFound,
    #[error("sender is blocked by recipient")]
    BlockedJid,
    #[error("recipient mailbox is full")]
    MailboxFull,
    #[error("domain {0} is not served locally")]
    NotLocalDomain(String),
    #[error("stream has no bound resource")]
    ResourceNotBound,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures raised while a module handles a request.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("stanza error: {0}")]
    Stanza(StanzaErrorCondition),
}

/// Startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("tls setup for {host} failed: {reason}")]
    Tls { host: String, reason: String },
}
