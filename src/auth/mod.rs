//! SASL authenticators (RFC 6120 §6).
//!
//! Each authenticator is a small state machine fed with the `<auth/>` and
//! `<response/>` elements of one negotiation. It answers with a challenge to
//! send back, with the final `<success/>`, or with a [`SaslError`] that the
//! stream renders inside `<failure/>`.

pub(crate) mod digest_md5;
mod plain;
pub mod scram;

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::Deserialize;
use thiserror::Error;

use crate::storage::Repository;
use crate::xml::{ns, Element};

pub use digest_md5::DigestMd5;
pub use plain::Plain;
pub use scram::{Scram, ScramHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SaslError {
    #[error("incorrect-encoding")]
    IncorrectEncoding,
    #[error("malformed-request")]
    MalformedRequest,
    #[error("not-authorized")]
    NotAuthorized,
    #[error("temporary-auth-failure")]
    TemporaryAuthFailure,
    #[error("invalid-mechanism")]
    InvalidMechanism,
}

impl SaslError {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslError::IncorrectEncoding => "incorrect-encoding",
            SaslError::MalformedRequest => "malformed-request",
            SaslError::NotAuthorized => "not-authorized",
            SaslError::TemporaryAuthFailure => "temporary-auth-failure",
            SaslError::InvalidMechanism => "invalid-mechanism",
        }
    }

    /// `<failure xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><kind/></failure>`
    pub fn element(&self) -> Element {
        Element::with_ns("failure", ns::SASL).child(Element::new(self.as_str()))
    }
}

/// Outcome of one successful negotiation step.
#[derive(Debug, Clone, PartialEq)]
pub enum SaslStep {
    /// Send this `<challenge/>` and wait for a `<response/>`.
    Continue(Element),
    /// Send this `<success/>`; the client is authenticated.
    Done(Element),
}

#[async_trait]
pub trait Authenticator: Send {
    fn mechanism(&self) -> Mechanism;
    fn username(&self) -> &str;
    fn authenticated(&self) -> bool;
    async fn process(&mut self, elem: &Element) -> Result<SaslStep, SaslError>;
    /// Drops any negotiation state so the mechanism can be retried.
    fn reset(&mut self);
}

/// Supported mechanisms, in advertisement order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Mechanism {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "digest_md5")]
    DigestMd5,
    #[serde(rename = "scram_sha_1")]
    ScramSha1,
    #[serde(rename = "scram_sha_256")]
    ScramSha256,
    #[serde(rename = "scram_sha_1_plus")]
    ScramSha1Plus,
    #[serde(rename = "scram_sha_256_plus")]
    ScramSha256Plus,
}

impl Mechanism {
    pub const ALL: [Mechanism; 6] = [
        Mechanism::Plain,
        Mechanism::DigestMd5,
        Mechanism::ScramSha1,
        Mechanism::ScramSha256,
        Mechanism::ScramSha1Plus,
        Mechanism::ScramSha256Plus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::DigestMd5 => "DIGEST-MD5",
            Mechanism::ScramSha1 => "SCRAM-SHA-1",
            Mechanism::ScramSha256 => "SCRAM-SHA-256",
            Mechanism::ScramSha1Plus => "SCRAM-SHA-1-PLUS",
            Mechanism::ScramSha256Plus => "SCRAM-SHA-256-PLUS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    pub fn uses_channel_binding(&self) -> bool {
        matches!(self, Mechanism::ScramSha1Plus | Mechanism::ScramSha256Plus)
    }
}

/// Everything an authenticator needs from its stream.
#[derive(Clone)]
pub struct AuthContext {
    pub repo: Arc<dyn Repository>,
    pub domain: String,
    pub secured: bool,
    /// `tls-unique` channel binding data of the underlying TLS session.
    pub channel_binding: Option<Vec<u8>>,
}

/// Builds a fresh authenticator for `mechanism`.
pub fn new_authenticator(mechanism: Mechanism, ctx: AuthContext) -> Box<dyn Authenticator> {
    match mechanism {
        Mechanism::Plain => Box::new(Plain::new(ctx)),
        Mechanism::DigestMd5 => Box::new(DigestMd5::new(ctx)),
        Mechanism::ScramSha1 => Box::new(Scram::new(ctx, ScramHash::Sha1, false)),
        Mechanism::ScramSha256 => Box::new(Scram::new(ctx, ScramHash::Sha256, false)),
        Mechanism::ScramSha1Plus => Box::new(Scram::new(ctx, ScramHash::Sha1, true)),
        Mechanism::ScramSha256Plus => Box::new(Scram::new(ctx, ScramHash::Sha256, true)),
    }
}

/// Decodes the base64 payload of an `<auth/>` or `<response/>`.
/// A lone `=` stands for an empty initial response.
fn decode_payload(elem: &Element) -> Result<Vec<u8>, SaslError> {
    let text = elem.get_text().trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(text)
        .map_err(|_| SaslError::IncorrectEncoding)
}

fn challenge(payload: &[u8]) -> Element {
    Element::with_ns("challenge", ns::SASL).text(BASE64.encode(payload))
}

fn success(payload: Option<&[u8]>) -> Element {
    let elem = Element::with_ns("success", ns::SASL);
    match payload {
        Some(p) => elem.text(BASE64.encode(p)),
        None => elem,
    }
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}
