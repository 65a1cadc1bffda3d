//! Per-stream state shared with the registry and modules.

use std::collections::HashSet;

use crate::jid::Jid;
use crate::xml::Presence;

/// Deliveries that happen at most once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Once {
    /// Pending subscription requests pushed after initial presence.
    RosterNotifications,
    /// Offline queue drained after the first available presence.
    OfflineDelivery,
}

#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub username: String,
    pub domain: String,
    pub resource: String,
    pub jid: Option<Jid>,
    pub presence: Option<Presence>,
    pub secured: bool,
    pub authenticated: bool,
    pub compressed: bool,
    pub roster_requested: bool,
    pub blocklist_requested: bool,
    /// An account was registered in-band on this stream.
    pub registered: bool,
    done: HashSet<Once>,
}

impl StreamContext {
    pub fn new(domain: &str, secured: bool) -> Self {
        Self {
            domain: domain.to_string(),
            secured,
            ..Default::default()
        }
    }

    /// Bound resource and an available presence.
    pub fn is_available(&self) -> bool {
        !self.resource.is_empty() && self.presence.as_ref().is_some_and(|p| p.is_available())
    }

    pub fn priority(&self) -> i8 {
        self.presence.as_ref().map(|p| p.priority()).unwrap_or(0)
    }

    /// Marks `flag` as done, returning `true` only the first time.
    pub fn take_once(&mut self, flag: Once) -> bool {
        self.done.insert(flag)
    }
}
