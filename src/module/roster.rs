//! Roster management (RFC 6121 §2), presence subscriptions (§3) and
//! presence broadcast (§4).

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Module;
use crate::c2s::context::Once;
use crate::error::{ModuleError, RouteError};
use crate::jid::Jid;
use crate::router::{Router, StreamHandle};
use crate::storage::{
    RosterItem, RosterNotification, RosterRepository, Subscription, UserRepository,
};
use crate::xml::{ns, Element, Iq, Presence, Stanza, StanzaErrorCondition};

pub struct Roster {
    router: Router,
    versioning: bool,
}

fn stanza_error(condition: StanzaErrorCondition) -> ModuleError {
    ModuleError::Stanza(condition)
}

impl Roster {
    pub fn new(router: Router, versioning: bool) -> Self {
        Self { router, versioning }
    }

    async fn send_roster(&self, stream: &StreamHandle, iq: &Iq, query: &Element) -> Result<(), ModuleError> {
        if !query.elements().is_empty() {
            return Err(stanza_error(StanzaErrorCondition::BadRequest));
        }
        let username = stream.username();
        let repo = self.router.repository();
        stream.update_context(|c| c.roster_requested = true);

        let version = repo.fetch_roster_version(&username).await?;
        if self.versioning && query.attr_str("ver") == version.to_string() {
            stream.reply(iq.result_iq());
            return Ok(());
        }
        let items = repo.fetch_roster_items(&username).await?;
        let mut result = Element::with_ns("query", ns::ROSTER);
        if self.versioning {
            result.set_attr("ver", version.to_string());
        }
        let result = result.children_from(items.iter().map(RosterItem::element));
        stream.reply(iq.result_with(result));
        Ok(())
    }

    async fn update_roster(&self, stream: &StreamHandle, iq: &Iq, query: &Element) -> Result<(), ModuleError> {
        let [item] = query.elements() else {
            return Err(stanza_error(StanzaErrorCondition::BadRequest));
        };
        if item.name() != "item" {
            return Err(stanza_error(StanzaErrorCondition::BadRequest));
        }
        let contact = item
            .attr_str("jid")
            .parse::<Jid>()
            .map_err(|_| stanza_error(StanzaErrorCondition::JidMalformed))?
            .to_bare();
        let username = stream.username();
        let repo = self.router.repository();

        if item.attr_str("subscription") == "remove" {
            self.remove_item(stream, &contact).await?;
            stream.reply(iq.result_iq());
            return Ok(());
        }

        let existing = repo.fetch_roster_item(&username, &contact.to_string()).await?;
        let (subscription, ask) = existing
            .map(|i| (i.subscription, i.ask))
            .unwrap_or((Subscription::None, false));
        let updated = RosterItem {
            username: username.clone(),
            jid: contact.to_string(),
            name: item.attr_str("name").to_string(),
            subscription,
            ask,
            groups: item
                .find_all("group")
                .map(|g| g.get_text().to_string())
                .filter(|g| !g.is_empty())
                .collect(),
        };
        self.save(&updated).await?;
        stream.reply(iq.result_iq());
        Ok(())
    }

    /// Removes `contact` from the stream owner's roster. A local contact
    /// loses its mirrored item as well.
    async fn remove_item(&self, stream: &StreamHandle, contact: &Jid) -> Result<(), ModuleError> {
        let username = stream.username();
        let user = self.owner_bare(stream)?;
        let repo = self.router.repository();
        let Some(item) = repo.fetch_roster_item(&username, &contact.to_string()).await? else {
            return Err(stanza_error(StanzaErrorCondition::ItemNotFound));
        };

        if item.subscription.sends_presence() {
            self.send_unavailable(stream, contact).await;
        }
        let version = repo.delete_roster_item(&username, &contact.to_string()).await?;
        let removed = RosterItem {
            subscription: Subscription::Remove,
            ask: false,
            ..item.clone()
        };
        self.push(&username, &removed, version).await;
        repo.delete_roster_notification(&username, &contact.to_string()).await?;

        if let Some(contact_name) = self.local_user(contact).await? {
            repo.delete_roster_notification(&contact_name, &user.to_string()).await?;
            if let Some(other) = repo.fetch_roster_item(&contact_name, &user.to_string()).await? {
                let version = repo.delete_roster_item(&contact_name, &user.to_string()).await?;
                let removed = RosterItem {
                    subscription: Subscription::Remove,
                    ask: false,
                    ..other
                };
                self.push(&contact_name, &removed, version).await;
            }
        }

        if item.subscription.receives_presence() || item.ask {
            self.route_presence(&Presence::with_type(&user, contact, "unsubscribe")).await;
        }
        if item.subscription.sends_presence() {
            self.route_presence(&Presence::with_type(&user, contact, "unsubscribed")).await;
        }
        Ok(())
    }

    /// Stores `item` and pushes it to the owner's interested resources.
    async fn save(&self, item: &RosterItem) -> Result<(), ModuleError> {
        let version = self.router.repository().upsert_roster_item(item).await?;
        self.push(&item.username, item, version).await;
        Ok(())
    }

    /// Roster push to every resource of `username` that requested the roster.
    async fn push(&self, username: &str, item: &RosterItem, version: i32) {
        for stream in self.router.registry().user_streams(username) {
            let Some(jid) = stream.jid() else {
                continue;
            };
            if !stream.with_context(|c| c.roster_requested) {
                continue;
            }
            let mut query = Element::with_ns("query", ns::ROSTER);
            if self.versioning {
                query.set_attr("ver", version.to_string());
            }
            let push = Element::new("iq")
                .attr("id", uuid::Uuid::new_v4().to_string())
                .attr("type", "set")
                .attr("from", jid.bare_string())
                .attr("to", jid.to_string())
                .child(query.child(item.element()));
            debug!(stream_id = %stream.id(), contact = %item.jid, "roster push");
            if let Err(e) = stream.deliver(push).await {
                warn!(stream_id = %stream.id(), error = %e, "roster push failed");
            }
        }
    }

    fn owner_bare(&self, stream: &StreamHandle) -> Result<Jid, ModuleError> {
        stream
            .jid()
            .map(|j| j.to_bare())
            .ok_or(ModuleError::Route(RouteError::ResourceNotBound))
    }

    /// Username of `jid` when it names an existing local account.
    async fn local_user(&self, jid: &Jid) -> Result<Option<String>, ModuleError> {
        if !self.router.hosts().is_local_host(jid.domain()) || jid.node().is_empty() {
            return Ok(None);
        }
        if !self.router.repository().user_exists(jid.node()).await? {
            return Ok(None);
        }
        Ok(Some(jid.node().to_string()))
    }

    async fn route_presence(&self, presence: &Presence) {
        let stanza = Stanza::Presence(presence.clone());
        match self.router.route(&stanza).await {
            Ok(()) => {}
            Err(RouteError::NotAuthenticated) | Err(RouteError::NotLocalDomain(_)) => {}
            Err(e) => debug!(to = %presence.to(), error = %e, "presence not routed"),
        }
    }

    /// Unavailable presence from each available resource of the stream
    /// owner to `contact`.
    async fn send_unavailable(&self, stream: &StreamHandle, contact: &Jid) {
        for own in self.router.registry().user_streams(&stream.username()) {
            if let Some(from) = own.jid().filter(|_| own.is_available()) {
                self.route_presence(&Presence::with_type(&from, contact, "unavailable"))
                    .await;
            }
        }
    }

    /// Current presence of each available resource of the stream owner,
    /// addressed to `contact`.
    async fn send_available(&self, stream: &StreamHandle, contact: &Jid) {
        for own in self.router.registry().user_streams(&stream.username()) {
            let presence = own.with_context(|c| c.presence.clone().filter(|_| c.is_available()));
            if let (Some(presence), Some(from)) = (presence, own.jid()) {
                self.route_presence(&presence.with_addresses(&from, contact)).await;
            }
        }
    }

    /// Handles a subscription-related presence sent by the stream owner.
    pub async fn process_presence(&self, stream: &StreamHandle, presence: &Presence) -> Result<(), ModuleError> {
        let user = self.owner_bare(stream)?;
        let contact = presence.to().to_bare();
        match presence.type_attr() {
            "subscribe" => self.subscribe(&user, &contact, presence).await,
            "subscribed" => self.subscribed(stream, &user, &contact, presence).await,
            "unsubscribe" => self.unsubscribe(&user, &contact, presence).await,
            "unsubscribed" => self.unsubscribed(stream, &user, &contact, presence).await,
            _ => Ok(()),
        }
    }

    async fn subscribe(&self, user: &Jid, contact: &Jid, presence: &Presence) -> Result<(), ModuleError> {
        let repo = self.router.repository();
        let item = repo.fetch_roster_item(user.node(), &contact.to_string()).await?;
        let item = match item {
            Some(item) if item.subscription.receives_presence() => item,
            Some(mut item) => {
                item.ask = true;
                self.save(&item).await?;
                item
            }
            None => {
                let item = RosterItem {
                    username: user.node().to_string(),
                    jid: contact.to_string(),
                    name: String::new(),
                    subscription: Subscription::None,
                    ask: true,
                    groups: Vec::new(),
                };
                self.save(&item).await?;
                item
            }
        };
        debug!(user = %user, contact = %contact, subscription = item.subscription.as_str(), "subscribe");

        let outgoing = presence.with_addresses(user, contact);
        if let Some(contact_name) = self.local_user(contact).await? {
            repo.upsert_roster_notification(&RosterNotification {
                contact: contact_name,
                jid: user.to_string(),
                presence: outgoing.element().clone(),
            })
            .await?;
        }
        self.route_presence(&outgoing).await;
        Ok(())
    }

    async fn subscribed(
        &self,
        stream: &StreamHandle,
        user: &Jid,
        contact: &Jid,
        presence: &Presence,
    ) -> Result<(), ModuleError> {
        let repo = self.router.repository();
        let item = repo.fetch_roster_item(user.node(), &contact.to_string()).await?;
        let pending = repo
            .fetch_roster_notification(user.node(), &contact.to_string())
            .await?
            .is_some();
        if item.is_none() && !pending {
            debug!(user = %user, contact = %contact, "subscribed without a pending request");
            return Ok(());
        }
        let contact_name = self.local_user(contact).await?;
        let other = match &contact_name {
            Some(contact_name) => {
                match repo.fetch_roster_item(contact_name, &user.to_string()).await? {
                    Some(other) => Some(other),
                    None => {
                        debug!(user = %user, contact = %contact, "subscribed without requester item");
                        return Ok(());
                    }
                }
            }
            None => None,
        };

        repo.delete_roster_notification(user.node(), &contact.to_string()).await?;
        let item = match item {
            Some(mut item) => {
                item.subscription = match item.subscription {
                    Subscription::None => Subscription::From,
                    Subscription::To => Subscription::Both,
                    s => s,
                };
                item
            }
            None => RosterItem {
                username: user.node().to_string(),
                jid: contact.to_string(),
                name: String::new(),
                subscription: Subscription::From,
                ask: false,
                groups: Vec::new(),
            },
        };
        self.save(&item).await?;

        let Some(mut other) = other else {
            return Ok(());
        };
        other.subscription = match other.subscription {
            Subscription::None => Subscription::To,
            Subscription::From => Subscription::Both,
            s => s,
        };
        other.ask = false;
        self.save(&other).await?;

        self.route_presence(&presence.with_addresses(user, contact)).await;
        self.send_available(stream, contact).await;
        Ok(())
    }

    async fn unsubscribe(&self, user: &Jid, contact: &Jid, presence: &Presence) -> Result<(), ModuleError> {
        let repo = self.router.repository();
        if let Some(mut item) = repo.fetch_roster_item(user.node(), &contact.to_string()).await? {
            item.subscription = match item.subscription {
                Subscription::To => Subscription::None,
                Subscription::Both => Subscription::From,
                s => s,
            };
            item.ask = false;
            self.save(&item).await?;
        }
        if let Some(contact_name) = self.local_user(contact).await? {
            if let Some(mut other) = repo.fetch_roster_item(&contact_name, &user.to_string()).await? {
                other.subscription = match other.subscription {
                    Subscription::From => Subscription::None,
                    Subscription::Both => Subscription::To,
                    s => s,
                };
                self.save(&other).await?;
            }
            repo.delete_roster_notification(&contact_name, &user.to_string()).await?;
        }
        self.route_presence(&presence.with_addresses(user, contact)).await;
        Ok(())
    }

    async fn unsubscribed(
        &self,
        stream: &StreamHandle,
        user: &Jid,
        contact: &Jid,
        presence: &Presence,
    ) -> Result<(), ModuleError> {
        let repo = self.router.repository();
        if let Some(mut item) = repo.fetch_roster_item(user.node(), &contact.to_string()).await? {
            item.subscription = match item.subscription {
                Subscription::From => Subscription::None,
                Subscription::Both => Subscription::To,
                s => s,
            };
            self.save(&item).await?;
        }
        repo.delete_roster_notification(user.node(), &contact.to_string()).await?;

        if let Some(contact_name) = self.local_user(contact).await? {
            if let Some(mut other) = repo.fetch_roster_item(&contact_name, &user.to_string()).await? {
                other.subscription = match other.subscription {
                    Subscription::To => Subscription::None,
                    Subscription::Both => Subscription::From,
                    s => s,
                };
                other.ask = false;
                self.save(&other).await?;
            }
        }
        self.route_presence(&presence.with_addresses(user, contact)).await;
        self.send_unavailable(stream, contact).await;
        Ok(())
    }

    /// Fans out a presence broadcast by the stream owner: to contacts that
    /// receive the owner's presence and to the owner's other resources.
    /// On `initial`, pending subscription requests and the presences of the
    /// owner's contacts are delivered back to the stream.
    pub async fn broadcast_presence(
        &self,
        stream: &StreamHandle,
        presence: &Presence,
        initial: bool,
    ) -> Result<(), ModuleError> {
        let Some(from) = stream.jid() else {
            return Ok(());
        };
        let username = stream.username();
        let repo = self.router.repository();

        if presence.is_available() && stream.update_context(|c| c.take_once(Once::RosterNotifications)) {
            for notification in repo.fetch_roster_notifications(&username).await? {
                if let Err(e) = stream.deliver(notification.presence).await {
                    warn!(stream_id = %stream.id(), error = %e, "subscription request delivery failed");
                }
            }
        }

        let items = repo.fetch_roster_items(&username).await?;
        for item in &items {
            let Ok(contact) = item.jid.parse::<Jid>() else {
                continue;
            };
            if item.subscription.sends_presence()
                && !self.router.is_blocked_jid(&contact, &username).await?
            {
                self.route_presence(&presence.with_addresses(&from, &contact)).await;
            }
            if initial && item.subscription.receives_presence() {
                self.probe(stream, &from, &contact).await;
            }
        }

        for own in self.router.registry().user_streams(&username) {
            if own.same_stream(stream) || !own.is_available() {
                continue;
            }
            if let Some(to) = own.jid() {
                let elem = presence.with_addresses(&from, &to).into_element();
                if let Err(e) = own.deliver(elem).await {
                    warn!(stream_id = %own.id(), error = %e, "presence delivery failed");
                }
            }
        }
        Ok(())
    }

    /// Delivers the presence of each available resource of `contact` to
    /// `stream`.
    async fn probe(&self, stream: &StreamHandle, to: &Jid, contact: &Jid) {
        if !self.router.hosts().is_local_host(contact.domain()) {
            return;
        }
        for other in self.router.registry().user_streams(contact.node()) {
            let presence = other.with_context(|c| c.presence.clone().filter(|_| c.is_available()));
            if let (Some(presence), Some(from)) = (presence, other.jid()) {
                let elem = presence.with_addresses(&from, to).into_element();
                if let Err(e) = stream.deliver(elem).await {
                    warn!(stream_id = %stream.id(), error = %e, "presence delivery failed");
                }
            }
        }
    }
}

#[async_trait]
impl Module for Roster {
    fn name(&self) -> &'static str {
        "roster"
    }

    fn stream_feature(&self, _domain: &str) -> Option<Element> {
        self.versioning
            .then(|| Element::with_ns("ver", ns::ROSTER_VER_FEATURE))
    }

    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::ROSTER
    }

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        if !iq.to().is_server() && iq.to().node() != stream.username() {
            return Err(stanza_error(StanzaErrorCondition::Forbidden));
        }
        let Some(query) = iq.payload().filter(|q| q.name() == "query") else {
            return Err(stanza_error(StanzaErrorCondition::BadRequest));
        };
        if iq.is_get() {
            self.send_roster(stream, iq, query).await
        } else {
            self.update_roster(stream, iq, query).await
        }
    }
}
