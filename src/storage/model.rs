//! Persisted entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::scram::{self, ScramCredentials, ScramHash};
use crate::xml::Element;

/// A registered account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
    pub scram_sha1: ScramCredentials,
    pub scram_sha256: ScramCredentials,
}

impl User {
    /// Creates a user, deriving SCRAM credentials from `password`.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            scram_sha1: scram::derive_credentials(ScramHash::Sha1, password),
            scram_sha256: scram::derive_credentials(ScramHash::Sha256, password),
        }
    }

    pub fn scram(&self, hash: ScramHash) -> &ScramCredentials {
        match hash {
            ScramHash::Sha1 => &self.scram_sha1,
            ScramHash::Sha256 => &self.scram_sha256,
        }
    }
}

/// Last logout of an account (XEP-0012).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Last {
    pub username: String,
    pub logged_out_at: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Subscription {
    None,
    From,
    To,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::From => "from",
            Subscription::To => "to",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "none" => Some(Subscription::None),
            "from" => Some(Subscription::From),
            "to" => Some(Subscription::To),
            "both" => Some(Subscription::Both),
            "remove" => Some(Subscription::Remove),
            _ => None,
        }
    }

    /// The owner receives the contact's presence.
    pub fn receives_presence(&self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }

    /// The contact receives the owner's presence.
    pub fn sends_presence(&self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    pub username: String,
    /// Bare JID of the contact.
    pub jid: String,
    pub name: String,
    pub subscription: Subscription,
    pub ask: bool,
    pub groups: Vec<String>,
}

impl RosterItem {
    /// `<item/>` as sent in roster results and pushes.
    pub fn element(&self) -> Element {
        let mut item = Element::new("item")
            .attr("jid", self.jid.as_str())
            .attr_opt("name", &self.name)
            .attr("subscription", self.subscription.as_str());
        if self.ask {
            item.set_attr("ask", "subscribe");
        }
        item.children_from(
            self.groups
                .iter()
                .map(|g| Element::new("group").text(g.as_str())),
        )
    }
}

/// A pending subscription request held for `contact`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterNotification {
    /// Username of the account being asked.
    pub contact: String,
    /// Bare JID of the requester.
    pub jid: String,
    pub presence: Element,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockListItem {
    pub username: String,
    /// Blocked pattern: full, bare, domain/resource or domain JID.
    pub jid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub node: String,
    pub ver: String,
    pub features: Vec<String>,
}

impl Capabilities {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveMessage {
    pub archive_id: String,
    pub id: String,
    pub from: String,
    pub to: String,
    pub message: Element,
    pub stamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubNode {
    pub host: String,
    pub name: String,
    pub options: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubAffiliation {
    pub jid: String,
    pub affiliation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubSubscription {
    pub subid: String,
    pub jid: String,
    pub subscription: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubItem {
    pub id: String,
    pub publisher: String,
    pub payload: Element,
}
