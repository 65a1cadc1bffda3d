//! One client stream, from the opening header to the closing one.
//!
//! A [`Stream`] owns its transport and runs in its own task. Other tasks
//! reach it only through its [`StreamHandle`]: deliveries and disconnect
//! requests arrive on the bounded mailbox, answers produced while the stream
//! handles its own input arrive on the reply queue, which is always drained
//! first.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::context::StreamContext;
use crate::auth::{new_authenticator, AuthContext, Authenticator, Mechanism, SaslError, SaslStep};
use crate::config::{C2sConfig, ResourceConflict, TransportKind};
use crate::error::{ModuleError, RouteError, TransportError};
use crate::jid::Jid;
use crate::module::Hub;
use crate::router::registry::CURRENT_STREAM;
use crate::router::{Router, StreamCommand, StreamHandle};
use crate::storage::{Last, LastRepository};
use crate::transport::Transport;
use crate::xml::stanza::make_error_element;
use crate::xml::{
    ns, Element, Iq, ParseError, ParseEvent, Presence, Stanza, StanzaErrorCondition,
    StreamErrorKind,
};

/// Negotiation state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for the opening header.
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    SessionStarted,
    Disconnected,
}

/// Process-wide collaborators every stream of a listener shares.
#[derive(Clone)]
pub struct Services {
    pub router: Router,
    pub hub: Arc<Hub>,
    pub config: Arc<C2sConfig>,
}

/// Strips the addresses of a reply to a stream that has no JID yet.
fn anonymous(mut reply: Element) -> Element {
    reply.remove_attr("from");
    reply.remove_attr("to");
    reply
}

fn blocked_condition() -> Element {
    Element::with_ns("blocked", ns::BLOCKING_ERRORS)
}

pub struct Stream<T> {
    id: String,
    state: State,
    transport: T,
    handle: StreamHandle,
    mailbox: mpsc::Receiver<StreamCommand>,
    replies: mpsc::UnboundedReceiver<Element>,
    router: Router,
    hub: Arc<Hub>,
    config: Arc<C2sConfig>,
    authenticator: Option<Box<dyn Authenticator>>,
    /// The server header of the current stream has been written.
    opened: bool,
    /// A write failed; nothing more can be sent.
    broken: bool,
}

impl<T: Transport> Stream<T> {
    pub fn new(id: String, transport: T, services: Services) -> Self {
        let (mailbox_tx, mailbox) = mpsc::channel(services.config.mailbox_size.max(1));
        let (reply_tx, replies) = mpsc::unbounded_channel();
        let context = StreamContext::new(
            services.router.hosts().default_host(),
            transport.is_secured(),
        );
        let handle = StreamHandle::new(id.clone(), mailbox_tx, reply_tx, context);
        Self {
            id,
            state: State::Connecting,
            transport,
            handle,
            mailbox,
            replies,
            router: services.router,
            hub: services.hub,
            config: services.config,
            authenticator: None,
            opened: false,
            broken: false,
        }
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Drives the stream until it disconnects.
    pub async fn run(mut self) {
        let id = self.id.clone();
        CURRENT_STREAM
            .scope(id, async move {
                debug!(stream_id = %self.id, kind = ?self.transport.kind(), "stream started");
                while self.state != State::Disconnected {
                    self.step().await;
                }
            })
            .await;
    }

    async fn step(&mut self) {
        let timeout = if self.handle.with_context(|c| c.authenticated) {
            self.config.transport.keep_alive
        } else {
            self.config.transport.connect_timeout
        };
        tokio::select! {
            biased;
            Some(elem) = self.replies.recv() => self.send(&elem).await,
            Some(cmd) = self.mailbox.recv() => match cmd {
                StreamCommand::Send(elem) => self.send(&elem).await,
                StreamCommand::Disconnect(kind) => self.disconnect(kind).await,
            },
            event = tokio::time::timeout(timeout, self.transport.read_element()) => match event {
                Ok(Ok(event)) => self.handle_event(event).await,
                Ok(Err(e)) => self.handle_transport_error(e).await,
                Err(_) => {
                    info!(stream_id = %self.id, state = ?self.state, "read timed out");
                    self.disconnect(Some(StreamErrorKind::ConnectionTimeout)).await;
                }
            },
        }
        if self.broken && self.state != State::Disconnected {
            self.disconnect(None).await;
        }
    }

    async fn send(&mut self, elem: &Element) {
        if self.broken {
            return;
        }
        debug!(stream_id = %self.id, xml = %elem.to_xml(), "send");
        if let Err(e) = self.transport.write_element(elem).await {
            warn!(stream_id = %self.id, error = %e, "write failed");
            self.broken = true;
        }
    }

    async fn write_header(&mut self) {
        let domain = self.handle.domain();
        let header_id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.transport.open_stream(&domain, &header_id).await {
            warn!(stream_id = %self.id, error = %e, "failed to open stream");
            self.broken = true;
        }
        self.opened = true;
    }

    /// Back to waiting for a new header after STARTTLS, SASL or compression.
    fn restart(&mut self) {
        self.state = State::Connecting;
        self.opened = false;
        self.authenticator = None;
        self.transport.restart();
    }

    async fn handle_transport_error(&mut self, e: TransportError) {
        match e {
            TransportError::Parse(ParseError::TooLargeStanza(max)) => {
                info!(stream_id = %self.id, max, "stanza too large");
                self.disconnect(Some(StreamErrorKind::PolicyViolation)).await;
            }
            TransportError::Parse(e) => {
                info!(stream_id = %self.id, error = %e, "malformed input");
                self.disconnect(Some(StreamErrorKind::InvalidXml)).await;
            }
            TransportError::Timeout => {
                self.disconnect(Some(StreamErrorKind::ConnectionTimeout)).await;
            }
            TransportError::Closed | TransportError::StreamClosedByPeer => {
                debug!(stream_id = %self.id, "connection closed by peer");
                self.broken = true;
                self.disconnect(None).await;
            }
            e => {
                warn!(stream_id = %self.id, error = %e, "transport failure");
                self.broken = true;
                self.disconnect(None).await;
            }
        }
    }

    async fn handle_event(&mut self, event: ParseEvent) {
        match event {
            ParseEvent::StreamOpen(elem) => {
                if self.state == State::Connecting {
                    self.open(elem).await;
                } else {
                    self.disconnect(Some(StreamErrorKind::InvalidXml)).await;
                }
            }
            ParseEvent::Element(elem) => {
                debug!(stream_id = %self.id, xml = %elem.to_xml(), "recv");
                match self.state {
                    State::Connecting => {
                        self.disconnect(Some(StreamErrorKind::InvalidXml)).await;
                    }
                    State::Connected => self.handle_connected(elem).await,
                    State::Authenticating => self.handle_authenticating(elem).await,
                    State::Authenticated => self.handle_authenticated(elem).await,
                    State::SessionStarted => self.handle_session_started(elem).await,
                    State::Disconnected => {}
                }
            }
            ParseEvent::StreamClosed => {
                debug!(stream_id = %self.id, "stream closed by peer");
                self.disconnect(None).await;
            }
        }
    }

    // Opening

    fn validate_open(&self, elem: &Element) -> Result<(), StreamErrorKind> {
        let (name, valid_namespace) = match self.transport.kind() {
            TransportKind::Websocket => ("open", elem.namespace() == ns::FRAMING),
            TransportKind::Socket => (
                "stream:stream",
                elem.namespace() == ns::CLIENT && elem.attr_str("xmlns:stream") == ns::STREAMS,
            ),
        };
        if elem.name() != name {
            return Err(StreamErrorKind::UnsupportedStanzaType);
        }
        if !valid_namespace {
            return Err(StreamErrorKind::InvalidNamespace);
        }
        let to = elem.attr_str("to");
        if !to.is_empty() && !self.router.hosts().is_local_host(&to.to_lowercase()) {
            return Err(StreamErrorKind::HostUnknown);
        }
        if elem.attr_str("version") != "1.0" {
            return Err(StreamErrorKind::UnsupportedVersion);
        }
        Ok(())
    }

    async fn open(&mut self, elem: Element) {
        if let Err(kind) = self.validate_open(&elem) {
            self.disconnect(Some(kind)).await;
            return;
        }
        let to = elem.attr_str("to").to_lowercase();
        if !to.is_empty() {
            self.handle.update_context(|c| c.domain = to);
        }
        if let Err(e) = self.router.registry().register(&self.handle) {
            error!(stream_id = %self.id, error = %e, "failed to register stream");
            self.disconnect(Some(StreamErrorKind::InternalServerError)).await;
            return;
        }
        self.write_header().await;
        let features = self.features();
        self.send(&features).await;
        self.state = if self.handle.with_context(|c| c.authenticated) {
            State::Authenticated
        } else {
            State::Connected
        };
    }

    fn mechanism_offered(&self, mechanism: Mechanism, secured: bool) -> bool {
        self.config.sasl.contains(&mechanism)
            && (!mechanism.uses_channel_binding()
                || (secured && self.transport.channel_binding_bytes().is_some()))
    }

    fn features(&self) -> Element {
        let (secured, authenticated, compressed, domain) = self
            .handle
            .with_context(|c| (c.secured, c.authenticated, c.compressed, c.domain.clone()));
        let socket = self.transport.kind() == TransportKind::Socket;
        let mut features = Element::new("stream:features");

        if !authenticated {
            if socket && !secured {
                features.append(
                    Element::with_ns("starttls", ns::TLS).child(Element::new("required")),
                );
                return features;
            }
            let mechanisms = Mechanism::ALL
                .into_iter()
                .filter(|m| self.mechanism_offered(*m, secured))
                .map(|m| Element::new("mechanism").text(m.name()));
            features.append(Element::with_ns("mechanisms", ns::SASL).children_from(mechanisms));
            if secured {
                if let Some(register) = &self.hub.register {
                    features.append(register.feature());
                }
            }
            return features;
        }

        if socket && !compressed && self.config.compression.is_some() {
            features.append(
                Element::with_ns("compression", ns::COMPRESS_FEATURE)
                    .child(Element::new("method").text("zlib")),
            );
        }
        features.append(Element::with_ns("bind", ns::BIND).child(Element::new("required")));
        features.append(Element::with_ns("session", ns::SESSION));
        for feature in self.hub.stream_features(&domain) {
            features.append(feature);
        }
        features
    }

    // Connected and authenticating

    async fn handle_connected(&mut self, elem: Element) {
        match (elem.name(), elem.namespace()) {
            ("starttls", ns::TLS) => self.start_tls().await,
            ("auth", ns::SASL) => self.start_authentication(elem).await,
            ("iq", _) => self.process_unauthenticated_iq(elem).await,
            _ => self.disconnect(Some(StreamErrorKind::NotAuthorized)).await,
        }
    }

    async fn start_tls(&mut self) {
        let secured = self.handle.with_context(|c| c.secured);
        if secured || self.transport.kind() != TransportKind::Socket {
            self.disconnect(Some(StreamErrorKind::NotAuthorized)).await;
            return;
        }
        let domain = self.handle.domain();
        let Some(tls) = self.router.hosts().tls_config(&domain) else {
            warn!(stream_id = %self.id, domain = %domain, "no certificate for starttls");
            self.send(&Element::with_ns("failure", ns::TLS)).await;
            self.disconnect(None).await;
            return;
        };
        self.send(&Element::with_ns("proceed", ns::TLS)).await;
        if self.broken {
            return;
        }
        if let Err(e) = self.transport.start_tls(tls).await {
            warn!(stream_id = %self.id, error = %e, "tls handshake failed");
            self.broken = true;
            return;
        }
        self.handle.update_context(|c| c.secured = true);
        info!(stream_id = %self.id, "tls established");
        self.restart();
    }

    async fn start_authentication(&mut self, elem: Element) {
        let secured = self.handle.with_context(|c| c.secured);
        if self.transport.kind() == TransportKind::Socket && !secured {
            self.disconnect(Some(StreamErrorKind::NotAuthorized)).await;
            return;
        }
        let mechanism = Mechanism::from_name(elem.attr_str("mechanism"))
            .filter(|m| self.mechanism_offered(*m, secured));
        let Some(mechanism) = mechanism else {
            self.send(&SaslError::InvalidMechanism.element()).await;
            return;
        };
        let ctx = AuthContext {
            repo: self.router.repository().clone(),
            domain: self.handle.domain(),
            secured,
            channel_binding: self.transport.channel_binding_bytes(),
        };
        self.authenticator = Some(new_authenticator(mechanism, ctx));
        self.continue_authentication(elem).await;
    }

    async fn continue_authentication(&mut self, elem: Element) {
        let Some(authenticator) = self.authenticator.as_mut() else {
            self.state = State::Connected;
            return;
        };
        match authenticator.process(&elem).await {
            Ok(SaslStep::Continue(challenge)) => {
                self.state = State::Authenticating;
                self.send(&challenge).await;
            }
            Ok(SaslStep::Done(success)) => {
                let username = authenticator.username().to_string();
                let mechanism = authenticator.mechanism();
                self.send(&success).await;
                self.handle.update_context(|c| {
                    c.jid = Jid::new(&username, &c.domain, "").ok();
                    c.username = username.clone();
                    c.authenticated = true;
                });
                info!(stream_id = %self.id, username = %username, mechanism = mechanism.name(), "authenticated");
                self.restart();
            }
            Err(e) => {
                info!(stream_id = %self.id, mechanism = authenticator.mechanism().name(), error = %e, "authentication failed");
                authenticator.reset();
                self.authenticator = None;
                self.state = State::Connected;
                self.send(&e.element()).await;
            }
        }
    }

    async fn handle_authenticating(&mut self, elem: Element) {
        match (elem.name(), elem.namespace()) {
            ("response", ns::SASL) => self.continue_authentication(elem).await,
            ("abort", ns::SASL) => {
                self.authenticator = None;
                self.state = State::Connected;
                let aborted = Element::with_ns("failure", ns::SASL).child(Element::new("aborted"));
                self.send(&aborted).await;
            }
            _ => self.disconnect(Some(StreamErrorKind::NotAuthorized)).await,
        }
    }

    /// In-band registration is the only IQ allowed before authentication.
    async fn process_unauthenticated_iq(&mut self, elem: Element) {
        let register = self.hub.register.clone().filter(|_| {
            self.handle.with_context(|c| c.secured)
                && elem.find_ns("query", ns::REGISTER).is_some()
        });
        let Some(register) = register else {
            self.disconnect(Some(StreamErrorKind::NotAuthorized)).await;
            return;
        };
        let Ok(server) = Jid::server(&self.handle.domain()) else {
            return;
        };
        let iq = match Iq::from_element(elem.clone(), &server, &server) {
            Ok(iq) => iq,
            Err(condition) => {
                self.handle
                    .reply(anonymous(make_error_element(&elem, condition, Vec::new())));
                return;
            }
        };
        match register.process_unauthenticated(&self.handle, &iq).await {
            Ok(()) => {}
            Err(ModuleError::Stanza(condition)) => {
                self.handle.reply(anonymous(iq.make_error(condition)));
            }
            Err(e) => {
                error!(stream_id = %self.id, error = %e, "registration failed");
                self.handle.reply(anonymous(
                    iq.make_error(StanzaErrorCondition::InternalServerError),
                ));
            }
        }
    }

    // Authenticated

    async fn handle_authenticated(&mut self, elem: Element) {
        let bound = !self.handle.resource().is_empty();
        match (elem.name(), elem.namespace()) {
            ("compress", ns::COMPRESS) => self.compress(elem).await,
            ("iq", _) if elem.type_attr() == "set" && elem.find_ns("bind", ns::BIND).is_some() => {
                if let Some(iq) = self.own_iq(elem) {
                    self.bind(iq).await;
                }
            }
            ("iq", _)
                if elem.type_attr() == "set" && elem.find_ns("session", ns::SESSION).is_some() =>
            {
                let Some(iq) = self.own_iq(elem) else {
                    return;
                };
                if bound {
                    self.handle.reply(iq.result_iq());
                    self.start_session();
                } else {
                    self.handle.reply(iq.make_error(StanzaErrorCondition::NotAllowed));
                }
            }
            ("iq" | "presence" | "message", _) if bound => {
                debug!(stream_id = %self.id, "implicit session");
                self.start_session();
                self.handle_session_started(elem).await;
            }
            _ => self.disconnect(Some(StreamErrorKind::NotAuthorized)).await,
        }
    }

    /// Parses a negotiation IQ addressed to the server, answering invalid ones.
    fn own_iq(&self, elem: Element) -> Option<Iq> {
        let jid = self.handle.jid()?;
        let server = jid.to_server();
        match Iq::from_element(elem.clone(), &jid, &server) {
            Ok(iq) => Some(iq),
            Err(condition) => {
                self.handle
                    .reply(make_error_element(&elem, condition, Vec::new()));
                None
            }
        }
    }

    async fn compress(&mut self, elem: Element) {
        let compressed = self.handle.with_context(|c| c.compressed);
        let level = match &self.config.compression {
            Some(c) if !compressed && self.transport.kind() == TransportKind::Socket => c.level,
            _ => {
                let failure = Element::with_ns("failure", ns::COMPRESS)
                    .child(Element::new("setup-failed"));
                self.send(&failure).await;
                return;
            }
        };
        let method = elem.find("method").map(|m| m.get_text()).unwrap_or("");
        if method != "zlib" {
            let failure = Element::with_ns("failure", ns::COMPRESS)
                .child(Element::new("unsupported-method"));
            self.send(&failure).await;
            return;
        }
        self.send(&Element::with_ns("compressed", ns::COMPRESS)).await;
        if let Err(e) = self.transport.enable_compression(level) {
            warn!(stream_id = %self.id, error = %e, "failed to enable compression");
            self.broken = true;
            return;
        }
        self.handle.update_context(|c| c.compressed = true);
        info!(stream_id = %self.id, "compression enabled");
        self.restart();
    }

    async fn bind(&mut self, iq: Iq) {
        if !self.handle.resource().is_empty() {
            self.handle.reply(iq.make_error(StanzaErrorCondition::NotAllowed));
            return;
        }
        let requested = iq
            .payload()
            .and_then(|bind| bind.find("resource"))
            .map(|r| r.get_text().trim().to_string())
            .unwrap_or_default();
        let resource = if requested.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            requested
        };
        let (username, domain) = self
            .handle
            .with_context(|c| (c.username.clone(), c.domain.clone()));
        let Ok(mut jid) = Jid::new(&username, &domain, &resource) else {
            self.handle.reply(iq.make_error(StanzaErrorCondition::BadRequest));
            return;
        };

        let conflicts: Vec<StreamHandle> = self
            .router
            .streams_matching_jid(&jid)
            .into_iter()
            .filter(|s| !s.same_stream(&self.handle))
            .collect();
        if !conflicts.is_empty() {
            match self.config.resource_conflict {
                ResourceConflict::Override => {
                    let digest = hex::encode(Sha256::digest(self.id.as_bytes()));
                    match jid.with_resource(&digest) {
                        Ok(overridden) => jid = overridden,
                        Err(e) => {
                            error!(stream_id = %self.id, error = %e, "failed to override resource");
                            self.handle
                                .reply(iq.make_error(StanzaErrorCondition::InternalServerError));
                            return;
                        }
                    }
                }
                ResourceConflict::Replace => {
                    for other in &conflicts {
                        info!(stream_id = %other.id(), jid = %jid, "replacing stream on resource conflict");
                        other.disconnect(Some(StreamErrorKind::ResourceConstraint));
                    }
                }
                ResourceConflict::Reject => {
                    info!(stream_id = %self.id, jid = %jid, "resource conflict");
                    self.handle.reply(iq.make_error(StanzaErrorCondition::Conflict));
                    return;
                }
            }
        }

        self.handle.update_context(|c| {
            c.resource = jid.resource().to_string();
            c.jid = Some(jid.clone());
        });
        if let Err(e) = self.router.registry().authenticate(&self.handle) {
            error!(stream_id = %self.id, error = %e, "failed to index bound stream");
            self.handle
                .reply(iq.make_error(StanzaErrorCondition::InternalServerError));
            return;
        }
        let bound = Element::with_ns("bind", ns::BIND)
            .child(Element::new("jid").text(jid.to_string()));
        self.handle.reply(iq.result_with(bound));
        info!(stream_id = %self.id, jid = %jid, "resource bound");
        if let Some(ping) = &self.hub.ping {
            ping.schedule(&self.handle);
        }
    }

    fn start_session(&mut self) {
        self.state = State::SessionStarted;
        if let Some(ping) = &self.hub.ping {
            ping.schedule(&self.handle);
        }
        debug!(stream_id = %self.id, "session started");
    }

    // Session

    async fn handle_session_started(&mut self, elem: Element) {
        if let Some(ping) = &self.hub.ping {
            ping.on_activity(&self.handle);
        }
        if !matches!(elem.name(), "iq" | "presence" | "message") {
            self.disconnect(Some(StreamErrorKind::UnsupportedStanzaType)).await;
            return;
        }
        let namespace = elem.namespace();
        if !namespace.is_empty() && namespace != ns::CLIENT {
            self.disconnect(Some(StreamErrorKind::InvalidNamespace)).await;
            return;
        }
        let Some(jid) = self.handle.jid() else {
            return;
        };
        let from = elem.attr_str("from");
        if !from.is_empty() {
            let matches = from
                .parse::<Jid>()
                .is_ok_and(|f| f == jid || f == jid.to_bare());
            if !matches {
                self.disconnect(Some(StreamErrorKind::InvalidFrom)).await;
                return;
            }
        }
        let to = match elem.get_attr("to").filter(|to| !to.is_empty()) {
            None => jid.to_bare(),
            Some(to) => match to.parse::<Jid>() {
                Ok(to) => to,
                Err(_) => {
                    if elem.type_attr() != "error" {
                        self.handle.reply(make_error_element(
                            &elem,
                            StanzaErrorCondition::JidMalformed,
                            Vec::new(),
                        ));
                    }
                    return;
                }
            },
        };
        match Stanza::from_element(elem.clone(), &jid, &to) {
            Some(Ok(stanza)) => self.process_stanza(stanza).await,
            Some(Err(condition)) => {
                if elem.type_attr() != "error" {
                    self.handle
                        .reply(make_error_element(&elem, condition, Vec::new()));
                }
            }
            None => {
                self.disconnect(Some(StreamErrorKind::UnsupportedStanzaType)).await;
            }
        }
    }

    async fn process_stanza(&mut self, stanza: Stanza) {
        let (username, domain) = self
            .handle
            .with_context(|c| (c.username.clone(), c.domain.clone()));
        let to = stanza.to().clone();
        let to_self = to.node() == username && to.domain() == domain;

        if !to.is_server() && !to_self {
            match self.router.is_blocked_jid(&to, &username).await {
                Ok(true) => {
                    if !stanza.is_error() {
                        self.handle.reply(
                            stanza.make_error_with(
                                StanzaErrorCondition::NotAcceptable,
                                vec![blocked_condition()],
                            ),
                        );
                    }
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!(stream_id = %self.id, error = %e, "block list lookup failed"),
            }
        }

        if !self.router.hosts().is_local_host(to.domain()) {
            debug!(stream_id = %self.id, to = %to, "dropping stanza to remote domain");
            return;
        }

        match stanza {
            Stanza::Presence(presence) => {
                if to_self && to.resource().is_empty() {
                    self.process_own_presence(presence).await;
                } else if let (true, Some(roster)) = (presence.is_subscription(), &self.hub.roster) {
                    if let Err(e) = roster.process_presence(&self.handle, &presence).await {
                        error!(stream_id = %self.id, error = %e, "subscription processing failed");
                    }
                } else {
                    self.route(Stanza::Presence(presence)).await;
                }
            }
            Stanza::Iq(iq) => {
                if (iq.is_result() || iq.is_error()) && to.is_server() {
                    if !self.hub.process_result(&self.handle, &iq).await {
                        debug!(stream_id = %self.id, id = iq.id(), "unsolicited iq result");
                    }
                } else if (iq.is_get() || iq.is_set()) && !to.is_full_with_user() {
                    self.hub.process_iq(&self.handle, &iq).await;
                } else {
                    self.route(Stanza::Iq(iq)).await;
                }
            }
            Stanza::Message(message) => self.route(Stanza::Message(message)).await,
        }
    }

    /// Presence broadcast by the owner: updates the context and fans out.
    async fn process_own_presence(&mut self, presence: Presence) {
        if !presence.is_available() && !presence.is_unavailable() {
            debug!(stream_id = %self.id, kind = presence.type_attr(), "ignoring presence to own account");
            return;
        }
        let was_available = self.handle.is_available();
        self.handle
            .update_context(|c| c.presence = Some(presence.clone()));

        if let Some(caps) = &self.hub.caps {
            if let Err(e) = caps.process_presence(&self.handle, &presence).await {
                warn!(stream_id = %self.id, error = %e, "capabilities lookup failed");
            }
        }
        if let Some(roster) = &self.hub.roster {
            let initial = presence.is_available() && !was_available;
            if let Err(e) = roster.broadcast_presence(&self.handle, &presence, initial).await {
                error!(stream_id = %self.id, error = %e, "presence broadcast failed");
            }
        }
        if presence.is_available() {
            if let Some(offline) = &self.hub.offline {
                if let Err(e) = offline.deliver(&self.handle).await {
                    error!(stream_id = %self.id, error = %e, "offline delivery failed");
                }
            }
        }
    }

    /// Hands `stanza` to the router and answers routing failures.
    async fn route(&mut self, mut stanza: Stanza) {
        let condition = loop {
            match self.router.route(&stanza).await {
                Ok(()) => return,
                Err(RouteError::ResourceNotFound) if matches!(stanza, Stanza::Message(_)) => {
                    let bare = stanza.to().to_bare();
                    stanza = stanza.with_addresses(&stanza.from().clone(), &bare);
                }
                Err(RouteError::NotAuthenticated) => {
                    let (Stanza::Message(message), Some(offline)) = (&stanza, &self.hub.offline)
                    else {
                        break StanzaErrorCondition::ServiceUnavailable;
                    };
                    match offline.archive_message(message).await {
                        Ok(()) => return,
                        Err(ModuleError::Stanza(condition)) => break condition,
                        Err(e) => {
                            error!(stream_id = %self.id, error = %e, "offline archival failed");
                            break StanzaErrorCondition::InternalServerError;
                        }
                    }
                }
                Err(RouteError::BlockedJid) => {
                    if !matches!(stanza, Stanza::Presence(_)) && !stanza.is_error() {
                        self.handle.reply(stanza.make_error_with(
                            StanzaErrorCondition::NotAcceptable,
                            vec![blocked_condition()],
                        ));
                    }
                    return;
                }
                Err(
                    RouteError::NotExistingAccount
                    | RouteError::ResourceNotFound
                    | RouteError::MailboxFull,
                ) => break StanzaErrorCondition::ServiceUnavailable,
                Err(e) => {
                    error!(stream_id = %self.id, error = %e, "routing failed");
                    break StanzaErrorCondition::InternalServerError;
                }
            }
        };
        if !matches!(stanza, Stanza::Presence(_)) && !stanza.is_error() {
            self.handle.reply(stanza.make_error(condition));
        }
    }

    // Disconnection

    async fn disconnect(&mut self, kind: Option<StreamErrorKind>) {
        if self.state == State::Disconnected {
            return;
        }
        while let Ok(elem) = self.replies.try_recv() {
            self.send(&elem).await;
        }
        if let Some(kind) = kind {
            info!(stream_id = %self.id, error = %kind, "stream error");
            if !self.opened && !self.broken {
                self.write_header().await;
            }
            self.send(&kind.element()).await;
        }
        self.state = State::Disconnected;

        let ctx = self.handle.context();
        if ctx.authenticated && !ctx.username.is_empty() {
            let last = Last {
                username: ctx.username.clone(),
                logged_out_at: chrono::Utc::now(),
                status: ctx
                    .presence
                    .as_ref()
                    .map(|p| p.status().to_string())
                    .unwrap_or_default(),
            };
            if let Err(e) = self.router.repository().upsert_last(&last).await {
                error!(stream_id = %self.id, error = %e, "failed to store last activity");
            }
        }
        if let (true, Some(jid)) = (ctx.is_available(), ctx.jid.as_ref()) {
            let unavailable = Presence::with_type(jid, &jid.to_bare(), "unavailable");
            self.handle
                .update_context(|c| c.presence = Some(unavailable.clone()));
            if let Some(roster) = &self.hub.roster {
                if let Err(e) = roster
                    .broadcast_presence(&self.handle, &unavailable, false)
                    .await
                {
                    error!(stream_id = %self.id, error = %e, "unavailable broadcast failed");
                }
            }
        }

        if self.opened && !self.broken {
            if let Err(e) = self.transport.close_stream().await {
                debug!(stream_id = %self.id, error = %e, "failed to close stream");
            }
        }
        self.router.registry().unregister(&self.handle);
        if let Some(ping) = &self.hub.ping {
            ping.cancel(&self.handle);
        }
        if let Err(e) = self.transport.close().await {
            debug!(stream_id = %self.id, error = %e, "failed to close transport");
        }
        self.mailbox.close();
        info!(stream_id = %self.id, jid = ?ctx.jid.map(|j| j.to_string()), "stream closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::digest_md5::tests::client_response;
    use crate::auth::tests::{auth_elem, decode_text, response_elem};
    use crate::config::{ModulesConfig, PingConfig, TimeoutAction};
    use crate::module::tests::test_router;
    use crate::storage::{BlockListItem, BlockListRepository, OfflineRepository, RosterRepository, Subscription};
    use crate::transport::mock::{pair, MockPeer, Written};
    use tokio::task::JoinHandle;

    fn c2s_config() -> C2sConfig {
        let mut config = C2sConfig::default();
        config.transport.keep_alive = Duration::from_secs(600);
        config
    }

    async fn setup(users: &[&str], config: C2sConfig, modules: ModulesConfig) -> Services {
        let router = test_router(users).await;
        let hub = Arc::new(Hub::new(&modules, router.clone()));
        Services {
            router,
            hub,
            config: Arc::new(config),
        }
    }

    struct Client {
        peer: MockPeer,
        handle: StreamHandle,
        task: JoinHandle<()>,
    }

    fn connect(services: &Services, id: &str, secured: bool) -> Client {
        let (transport, peer) = pair(TransportKind::Socket, secured);
        let stream = Stream::new(id.to_string(), transport, services.clone());
        let handle = stream.handle();
        Client {
            peer,
            handle,
            task: tokio::spawn(stream.run()),
        }
    }

    impl Client {
        async fn authenticate(&mut self, username: &str) {
            self.peer.open("jackal.im");
            let features = self.peer.recv_element().await;
            assert!(features.find_ns("mechanisms", ns::SASL).is_some());
            let payload = format!("\u{0}{username}\u{0}1234");
            self.peer.send(auth_elem("PLAIN", payload.as_bytes()));
            assert_eq!(self.peer.recv_element().await.name(), "success");
            self.peer.open("jackal.im");
            let features = self.peer.recv_element().await;
            assert!(features.find_ns("bind", ns::BIND).is_some());
        }

        async fn bind(&mut self, resource: &str) -> Element {
            self.peer.send_xml(&format!(
                r#"<iq id="b1" type="set"><bind xmlns="urn:ietf:params:xml:ns:xmpp-bind"><resource>{resource}</resource></bind></iq>"#
            ));
            self.peer.recv_element().await
        }

        async fn login(&mut self, username: &str, resource: &str) {
            self.authenticate(username).await;
            assert_eq!(self.bind(resource).await.type_attr(), "result");
        }

        /// Round-trips a ping so everything sent before has been processed.
        async fn sync(&mut self) {
            self.peer.send_xml(
                r#"<iq id="sync" type="get" to="jackal.im"><ping xmlns="urn:xmpp:ping"/></iq>"#,
            );
            let reply = self.peer.recv_element().await;
            assert_eq!(reply.id(), "sync");
            assert_eq!(reply.type_attr(), "result");
        }
    }

    #[tokio::test]
    async fn test_features_before_authentication() {
        let services = setup(&[], c2s_config(), ModulesConfig::default()).await;

        let mut plain = connect(&services, "s1", false);
        plain.peer.open("jackal.im");
        let features = plain.peer.recv_element().await;
        assert!(features.find_ns("starttls", ns::TLS).unwrap().find("required").is_some());
        assert!(features.find_ns("mechanisms", ns::SASL).is_none());

        let mut secured = connect(&services, "s2", true);
        secured.peer.open("jackal.im");
        let features = secured.peer.recv_element().await;
        let mechanisms: Vec<_> = features
            .find_ns("mechanisms", ns::SASL)
            .unwrap()
            .find_all("mechanism")
            .map(|m| m.get_text().to_string())
            .collect();
        assert!(mechanisms.contains(&"PLAIN".to_string()));
        assert!(mechanisms.contains(&"SCRAM-SHA-1-PLUS".to_string()));
        assert!(features.find_ns("register", ns::REGISTER_FEATURE).is_some());
    }

    #[tokio::test]
    async fn test_unknown_host_is_rejected() {
        let services = setup(&[], c2s_config(), ModulesConfig::default()).await;
        let mut client = connect(&services, "s1", true);
        client.peer.open("example.org");
        assert!(matches!(client.peer.recv().await, Some(Written::Open { .. })));
        let error = client.peer.recv_element().await;
        assert_eq!(error.name(), "stream:error");
        assert!(error.find("host-unknown").is_some());
        assert_eq!(client.peer.recv().await, Some(Written::Close));
        client.task.await.unwrap();
        assert!(services.router.registry().is_empty());
    }

    #[tokio::test]
    async fn test_stanza_before_authentication_is_not_authorized() {
        let services = setup(&[], c2s_config(), ModulesConfig::default()).await;
        let mut client = connect(&services, "s1", true);
        client.peer.open("jackal.im");
        client.peer.recv_element().await;
        client.peer.send_xml(r#"<message to="ortuman@jackal.im"><body>hi</body></message>"#);
        let error = client.peer.recv_element().await;
        assert!(error.find("not-authorized").is_some());
        assert_eq!(client.peer.recv().await, Some(Written::Close));
    }

    #[tokio::test]
    async fn test_bind_conflict_with_reject() {
        let mut config = c2s_config();
        config.resource_conflict = ResourceConflict::Reject;
        let services = setup(&["ortuman"], config, ModulesConfig::default()).await;

        let mut s1 = connect(&services, "s1", true);
        s1.login("ortuman", "balcony").await;

        let mut s2 = connect(&services, "s2", true);
        s2.authenticate("ortuman").await;
        let reply = s2.bind("balcony").await;
        assert_eq!(reply.id(), "b1");
        assert_eq!(reply.type_attr(), "error");
        assert!(reply.find("error").unwrap().find("conflict").is_some());
        assert!(s2.handle.resource().is_empty());
        assert!(s2.handle.with_context(|c| c.authenticated));
        assert_eq!(services.router.registry().user_streams("ortuman").len(), 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_with_replace_and_override() {
        let services = setup(&["ortuman"], c2s_config(), ModulesConfig::default()).await;
        let mut s1 = connect(&services, "s1", true);
        s1.login("ortuman", "balcony").await;
        let mut s2 = connect(&services, "s2", true);
        s2.login("ortuman", "balcony").await;

        let error = s1.peer.recv_element().await;
        assert!(error.find("resource-constraint").is_some());
        s1.task.await.unwrap();
        let streams = services.router.registry().user_streams("ortuman");
        assert_eq!(streams.len(), 1);
        assert!(streams[0].same_stream(&s2.handle));

        let mut config = c2s_config();
        config.resource_conflict = ResourceConflict::Override;
        let services = setup(&["ortuman"], config, ModulesConfig::default()).await;
        let mut s1 = connect(&services, "s1", true);
        s1.login("ortuman", "balcony").await;
        let mut s2 = connect(&services, "s2", true);
        s2.authenticate("ortuman").await;
        let reply = s2.bind("balcony").await;
        let expected = hex::encode(Sha256::digest(b"s2"));
        assert_eq!(
            reply.find_ns("bind", ns::BIND).unwrap().find("jid").unwrap().get_text(),
            format!("ortuman@jackal.im/{expected}")
        );
        assert_eq!(s2.handle.resource(), expected);
    }

    #[tokio::test]
    async fn test_roster_push_on_add() {
        let services = setup(&["ortuman", "noelia"], c2s_config(), ModulesConfig::default()).await;
        let mut client = connect(&services, "s1", true);
        client.login("ortuman", "balcony").await;

        client
            .peer
            .send_xml(r#"<iq id="g1" type="get"><query xmlns="jabber:iq:roster"/></iq>"#);
        assert_eq!(client.peer.recv_element().await.id(), "g1");

        client.peer.send_xml(
            r#"<iq id="r1" type="set"><query xmlns="jabber:iq:roster"><item jid="noelia@jackal.im" name="My Juliet" subscription="none"/></query></iq>"#,
        );
        let first = client.peer.recv_element().await;
        let second = client.peer.recv_element().await;
        let (push, result) = if first.id() == "r1" { (second, first) } else { (first, second) };
        assert_eq!(result.type_attr(), "result");
        assert_eq!(push.type_attr(), "set");
        let items = push.find_ns("query", ns::ROSTER).unwrap().elements();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attr_str("jid"), "noelia@jackal.im");
        assert_eq!(items[0].attr_str("name"), "My Juliet");
        assert_eq!(items[0].attr_str("subscription"), "none");

        let stored = services
            .router
            .repository()
            .fetch_roster_item("ortuman", "noelia@jackal.im")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "My Juliet");
        assert_eq!(stored.subscription, Subscription::None);
    }

    #[tokio::test]
    async fn test_offline_archival_and_delivery() {
        let services = setup(&["ortuman", "juliet"], c2s_config(), ModulesConfig::default()).await;
        let mut ortuman = connect(&services, "s1", true);
        ortuman.login("ortuman", "balcony").await;
        ortuman.peer.send_xml(
            r#"<message type="chat" to="juliet@jackal.im" id="m1"><body>Hi</body></message>"#,
        );
        ortuman.sync().await;

        let repo = services.router.repository().clone();
        let stored = repo.fetch_offline_messages("juliet").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].find_ns("delay", ns::DELAY).unwrap().attr_str("from"), "jackal.im");

        let mut juliet = connect(&services, "s2", true);
        juliet.login("juliet", "garden").await;
        juliet
            .peer
            .send_xml(r#"<presence><priority>5</priority></presence>"#);
        let message = juliet.peer.recv_element().await;
        assert_eq!(message.id(), "m1");
        assert_eq!(message.find("body").unwrap().get_text(), "Hi");
        assert!(message.find_ns("delay", ns::DELAY).is_some());
        juliet.sync().await;
        assert_eq!(repo.count_offline_messages("juliet").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_kills_stream() {
        let modules = ModulesConfig {
            ping: PingConfig {
                send_pings: true,
                interval: Duration::from_secs(1),
                ack_timeout: Duration::from_secs(1),
                timeout_action: TimeoutAction::Kill,
            },
            ..Default::default()
        };
        let services = setup(&["ortuman"], c2s_config(), modules).await;
        let mut client = connect(&services, "s1", true);
        client.login("ortuman", "balcony").await;

        let ping = client.peer.recv_element().await;
        assert_eq!(ping.type_attr(), "get");
        assert!(ping.find_ns("ping", ns::PING).is_some());
        assert_eq!(ping.attr_str("to"), "ortuman@jackal.im/balcony");

        let error = client.peer.recv_element().await;
        assert_eq!(error.name(), "stream:error");
        assert!(error.find("connection-timeout").is_some());
        assert_eq!(client.peer.recv().await, Some(Written::Close));
        client.task.await.unwrap();
        assert!(services.router.registry().is_empty());
    }

    #[tokio::test]
    async fn test_digest_md5_wrong_password() {
        let services = setup(&["mariana"], c2s_config(), ModulesConfig::default()).await;
        let mut client = connect(&services, "s1", true);
        client.peer.open("jackal.im");
        client.peer.recv_element().await;

        client.peer.send(auth_elem("DIGEST-MD5", b""));
        let challenge = decode_text(&client.peer.recv_element().await);
        let response = client_response(&challenge, "bad");
        client.peer.send(response_elem(response.as_bytes()));
        let failure = client.peer.recv_element().await;
        assert_eq!(
            failure.to_xml(),
            r#"<failure xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><not-authorized/></failure>"#
        );
        assert!(!client.handle.with_context(|c| c.authenticated));

        // Back in connected: a fresh negotiation succeeds.
        client.peer.send(auth_elem("PLAIN", b"\0mariana\x001234"));
        assert_eq!(client.peer.recv_element().await.name(), "success");
        assert_eq!(client.handle.username(), "mariana");
    }

    #[tokio::test]
    async fn test_invalid_mechanism() {
        let services = setup(&["mariana"], c2s_config(), ModulesConfig::default()).await;
        let mut client = connect(&services, "s1", true);
        client.peer.open("jackal.im");
        client.peer.recv_element().await;
        client.peer.send(auth_elem("X-OAUTH2", b""));
        let failure = client.peer.recv_element().await;
        assert!(failure.find("invalid-mechanism").is_some());
    }

    #[tokio::test]
    async fn test_blocked_delivery() {
        let services = setup(&["ortuman", "hamlet"], c2s_config(), ModulesConfig::default()).await;
        services
            .router
            .repository()
            .upsert_block_list_item(&BlockListItem {
                username: "ortuman".to_string(),
                jid: "jackal.im/balcony".to_string(),
            })
            .await
            .unwrap();
        let mut ortuman = connect(&services, "s1", true);
        ortuman.login("ortuman", "balcony").await;
        ortuman.peer.send_xml("<presence/>");
        ortuman.sync().await;

        let mut hamlet = connect(&services, "s2", true);
        hamlet.login("hamlet", "balcony").await;
        hamlet.peer.send_xml(
            r#"<iq id="v1" type="get" to="ortuman@jackal.im/balcony"><query xmlns="jabber:iq:version"/></iq>"#,
        );
        let reply = hamlet.peer.recv_element().await;
        assert_eq!(reply.id(), "v1");
        assert_eq!(reply.type_attr(), "error");
        let error = reply.find("error").unwrap();
        assert!(error.find("not-acceptable").is_some());
        assert!(error.find_ns("blocked", ns::BLOCKING_ERRORS).is_some());

        ortuman.sync().await;
        assert!(ortuman.peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_outbound_stanza_to_blocked_jid() {
        let services = setup(&["ortuman", "noelia"], c2s_config(), ModulesConfig::default()).await;
        services
            .router
            .repository()
            .upsert_block_list_item(&BlockListItem {
                username: "ortuman".to_string(),
                jid: "noelia@jackal.im".to_string(),
            })
            .await
            .unwrap();
        let mut client = connect(&services, "s1", true);
        client.login("ortuman", "balcony").await;
        client.peer.send_xml(
            r#"<message id="m1" type="chat" to="noelia@jackal.im"><body>hi</body></message>"#,
        );
        let reply = client.peer.recv_element().await;
        assert_eq!(reply.type_attr(), "error");
        assert!(reply.find("error").unwrap().find_ns("blocked", ns::BLOCKING_ERRORS).is_some());
        assert_eq!(
            services.router.repository().count_offline_messages("noelia").await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_message_between_resources_and_invalid_from() {
        let services = setup(&["ortuman", "noelia"], c2s_config(), ModulesConfig::default()).await;
        let mut ortuman = connect(&services, "s1", true);
        ortuman.login("ortuman", "balcony").await;
        let mut noelia = connect(&services, "s2", true);
        noelia.login("noelia", "garden").await;
        noelia.peer.send_xml("<presence/>");
        noelia.sync().await;

        ortuman.peer.send_xml(
            r#"<message id="m1" type="chat" to="noelia@jackal.im/garden"><body>hello</body></message>"#,
        );
        let message = noelia.peer.recv_element().await;
        assert_eq!(message.attr_str("from"), "ortuman@jackal.im/balcony");
        assert_eq!(message.find("body").unwrap().get_text(), "hello");

        ortuman.peer.send_xml(
            r#"<message id="m2" from="noelia@jackal.im/garden" to="noelia@jackal.im"><body>x</body></message>"#,
        );
        let error = ortuman.peer.recv_element().await;
        assert!(error.find("invalid-from").is_some());
        assert_eq!(ortuman.peer.recv().await, Some(Written::Close));
    }

    #[tokio::test]
    async fn test_presence_reaches_subscribed_contact_and_disconnect_persists_last() {
        let services = setup(&["ortuman", "noelia"], c2s_config(), ModulesConfig::default()).await;
        let repo = services.router.repository().clone();
        for (user, contact) in [("ortuman", "noelia"), ("noelia", "ortuman")] {
            repo.upsert_roster_item(&crate::storage::RosterItem {
                username: user.to_string(),
                jid: format!("{contact}@jackal.im"),
                name: String::new(),
                subscription: Subscription::Both,
                ask: false,
                groups: Vec::new(),
            })
            .await
            .unwrap();
        }
        let mut noelia = connect(&services, "s2", true);
        noelia.login("noelia", "garden").await;
        noelia.peer.send_xml("<presence/>");
        noelia.sync().await;

        let mut ortuman = connect(&services, "s1", true);
        ortuman.login("ortuman", "balcony").await;
        ortuman
            .peer
            .send_xml("<presence><status>Away for lunch</status></presence>");
        // Initial presence probes noelia.
        let probed = ortuman.peer.recv_element().await;
        assert_eq!(probed.attr_str("from"), "noelia@jackal.im/garden");

        let available = noelia.peer.recv_element().await;
        assert_eq!(available.attr_str("from"), "ortuman@jackal.im/balcony");
        assert_eq!(available.type_attr(), "");

        ortuman.peer.send_event(Ok(ParseEvent::StreamClosed));
        assert_eq!(ortuman.peer.recv().await, Some(Written::Close));
        ortuman.task.await.unwrap();

        let unavailable = noelia.peer.recv_element().await;
        assert_eq!(unavailable.type_attr(), "unavailable");
        let last = repo.fetch_last("ortuman").await.unwrap().unwrap();
        assert_eq!(last.status, "Away for lunch");
        assert_eq!(services.router.registry().user_streams("ortuman").len(), 0);
    }

    #[tokio::test]
    async fn test_in_band_registration_before_authentication() {
        let modules = ModulesConfig {
            registration: crate::config::RegistrationConfig {
                allow_registration: true,
                allow_change: true,
                allow_cancel: true,
            },
            ..Default::default()
        };
        let services = setup(&[], c2s_config(), modules).await;
        let mut client = connect(&services, "s1", true);
        client.peer.open("jackal.im");
        client.peer.recv_element().await;
        client.peer.send_xml(
            r#"<iq id="reg1" type="set"><query xmlns="jabber:iq:register"><username>romeo</username><password>secret</password></query></iq>"#,
        );
        let reply = client.peer.recv_element().await;
        assert_eq!(reply.type_attr(), "result");
        assert!(reply.get_attr("to").is_none());

        client.peer.send(auth_elem("PLAIN", b"\0romeo\0secret"));
        assert_eq!(client.peer.recv_element().await.name(), "success");
    }
}
