//! Stream and stanza error conditions (RFC 6120 §4.9 and §8.3).

use std::fmt;

use super::{ns, Element};

/// Fatal stream-level error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    InvalidXml,
    InvalidNamespace,
    HostUnknown,
    InvalidFrom,
    ConnectionTimeout,
    UnsupportedStanzaType,
    UnsupportedVersion,
    NotAuthorized,
    ResourceConstraint,
    InternalServerError,
    PolicyViolation,
    SystemShutdown,
}

impl StreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorKind::InvalidXml => "invalid-xml",
            StreamErrorKind::InvalidNamespace => "invalid-namespace",
            StreamErrorKind::HostUnknown => "host-unknown",
            StreamErrorKind::InvalidFrom => "invalid-from",
            StreamErrorKind::ConnectionTimeout => "connection-timeout",
            StreamErrorKind::UnsupportedStanzaType => "unsupported-stanza-type",
            StreamErrorKind::UnsupportedVersion => "unsupported-version",
            StreamErrorKind::NotAuthorized => "not-authorized",
            StreamErrorKind::ResourceConstraint => "resource-constraint",
            StreamErrorKind::InternalServerError => "internal-server-error",
            StreamErrorKind::PolicyViolation => "policy-violation",
            StreamErrorKind::SystemShutdown => "system-shutdown",
        }
    }

    /// `<stream:error><kind xmlns="urn:ietf:params:xml:ns:xmpp-streams"/></stream:error>`
    pub fn element(&self) -> Element {
        Element::new("stream:error").child(Element::with_ns(self.as_str(), ns::STREAM_ERRORS))
    }
}

impl fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stanza-level defined conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    ItemNotFound,
    InternalServerError,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    RemoteServerNotFound,
    ResourceConstraint,
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            StanzaErrorCondition::BadRequest => "bad-request",
            StanzaErrorCondition::Conflict => "conflict",
            StanzaErrorCondition::FeatureNotImplemented => "feature-not-implemented",
            StanzaErrorCondition::Forbidden => "forbidden",
            StanzaErrorCondition::ItemNotFound => "item-not-found",
            StanzaErrorCondition::InternalServerError => "internal-server-error",
            StanzaErrorCondition::JidMalformed => "jid-malformed",
            StanzaErrorCondition::NotAcceptable => "not-acceptable",
            StanzaErrorCondition::NotAllowed => "not-allowed",
            StanzaErrorCondition::NotAuthorized => "not-authorized",
            StanzaErrorCondition::RemoteServerNotFound => "remote-server-not-found",
            StanzaErrorCondition::ResourceConstraint => "resource-constraint",
            StanzaErrorCondition::ServiceUnavailable => "service-unavailable",
        }
    }

    /// Legacy numeric code, still expected by older clients.
    pub fn code(&self) -> u16 {
        match self {
            StanzaErrorCondition::BadRequest | StanzaErrorCondition::JidMalformed => 400,
            StanzaErrorCondition::NotAuthorized => 401,
            StanzaErrorCondition::Forbidden => 403,
            StanzaErrorCondition::ItemNotFound | StanzaErrorCondition::RemoteServerNotFound => 404,
            StanzaErrorCondition::NotAllowed | StanzaErrorCondition::NotAcceptable => 405,
            StanzaErrorCondition::Conflict => 409,
            StanzaErrorCondition::InternalServerError | StanzaErrorCondition::ResourceConstraint => 500,
            StanzaErrorCondition::FeatureNotImplemented | StanzaErrorCondition::ServiceUnavailable => 503,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            StanzaErrorCondition::BadRequest
            | StanzaErrorCondition::JidMalformed
            | StanzaErrorCondition::NotAcceptable => "modify",
            StanzaErrorCondition::Forbidden | StanzaErrorCondition::NotAuthorized => "auth",
            StanzaErrorCondition::InternalServerError | StanzaErrorCondition::ResourceConstraint => {
                "wait"
            }
            _ => "cancel",
        }
    }

    /// The `<error/>` child, with optional application-specific conditions.
    pub fn element(&self, app_conditions: Vec<Element>) -> Element {
        Element::new("error")
            .attr("code", self.code().to_string())
            .attr("type", self.error_type())
            .child(Element::with_ns(self.as_str(), ns::STANZAS))
            .children_from(app_conditions)
    }
}

impl fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
