//! jackal: an XMPP client-to-server daemon.
//!
//! Streams are negotiated by [`c2s`], addressed through [`router`], and
//! extended by the protocol [`module`]s. Persistent state lives behind the
//! [`storage::Repository`] seam.

pub mod auth;
pub mod c2s;
pub mod config;
pub mod error;
pub mod host;
pub mod jid;
pub mod module;
pub mod router;
pub mod storage;
pub mod transport;
pub mod xml;
