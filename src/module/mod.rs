//! Protocol extension modules and the hub dispatching IQs to them.
//!
//! Modules are process-wide and stateless with respect to a single stream:
//! every handler receives the [`StreamHandle`] of the stream that issued the
//! request and answers through it.

pub mod blocking;
pub mod caps;
pub mod disco;
pub mod last_activity;
pub mod offline;
pub mod ping;
pub mod private;
pub mod register;
pub mod roster;
pub mod vcard;
pub mod version;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::config::{ModuleName, ModulesConfig};
use crate::error::ModuleError;
use crate::router::{Router, StreamHandle};
use crate::xml::{Element, Iq, StanzaErrorCondition};

pub use blocking::BlockingCommand;
pub use caps::EntityCaps;
pub use disco::Disco;
pub use last_activity::LastActivity;
pub use offline::Offline;
pub use ping::Ping;
pub use private::Private;
pub use register::Register;
pub use roster::Roster;
pub use vcard::VCard;
pub use version::Version;

#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Features advertised on the server JID.
    fn server_features(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Features advertised on account JIDs.
    fn account_features(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Element added to `<stream:features/>` once authenticated.
    fn stream_feature(&self, _domain: &str) -> Option<Element> {
        None
    }

    /// Whether this module handles IQs whose payload lives in `namespace`.
    fn matches_namespace(&self, namespace: &str, server_target: bool) -> bool;

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError>;

    async fn start(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Enabled modules in registration order, plus typed access to the ones the
/// stream calls outside IQ dispatch.
pub struct Hub {
    modules: Vec<Arc<dyn Module>>,
    pub roster: Option<Arc<Roster>>,
    pub offline: Option<Arc<Offline>>,
    pub register: Option<Arc<Register>>,
    pub ping: Option<Arc<Ping>>,
    pub blocking: Option<Arc<BlockingCommand>>,
    pub caps: Option<Arc<EntityCaps>>,
}

impl Hub {
    pub fn new(config: &ModulesConfig, router: Router) -> Self {
        let mut hub = Hub {
            modules: Vec::new(),
            roster: None,
            offline: None,
            register: None,
            ping: None,
            blocking: None,
            caps: None,
        };
        let mut with_disco = false;
        for name in &config.enabled {
            match name {
                ModuleName::Roster => {
                    let m = Arc::new(Roster::new(router.clone(), config.roster.versioning));
                    hub.roster = Some(m.clone());
                    hub.modules.push(m);
                }
                ModuleName::Offline => {
                    let m = Arc::new(Offline::new(router.clone(), config.offline.queue_size));
                    hub.offline = Some(m.clone());
                    hub.modules.push(m);
                }
                ModuleName::Registration => {
                    let m = Arc::new(Register::new(router.clone(), config.registration.clone()));
                    hub.register = Some(m.clone());
                    hub.modules.push(m);
                }
                ModuleName::Version => {
                    hub.modules.push(Arc::new(Version::new(config.version.show_os)));
                }
                ModuleName::Ping => {
                    let m = Arc::new(Ping::new(config.ping.clone()));
                    hub.ping = Some(m.clone());
                    hub.modules.push(m);
                }
                ModuleName::LastActivity => {
                    hub.modules.push(Arc::new(LastActivity::new(router.clone())));
                }
                ModuleName::Private => {
                    hub.modules.push(Arc::new(Private::new(router.clone())));
                }
                ModuleName::Vcard => {
                    hub.modules.push(Arc::new(VCard::new(router.clone())));
                }
                ModuleName::BlockingCommand => {
                    let m = Arc::new(BlockingCommand::new(router.clone()));
                    hub.blocking = Some(m.clone());
                    hub.modules.push(m);
                }
                ModuleName::Caps => {
                    let m = Arc::new(EntityCaps::new(router.clone()));
                    hub.caps = Some(m.clone());
                    hub.modules.push(m);
                }
                ModuleName::Disco => with_disco = true,
            }
        }
        // Disco advertises everything else, so it is built last.
        if with_disco {
            let mut server_features = hub.server_features();
            let mut account_features = hub.account_features();
            for feature in disco::FEATURES {
                server_features.push(feature);
                account_features.push(feature);
            }
            hub.modules.push(Arc::new(Disco::new(
                router,
                server_features,
                account_features,
            )));
        }
        hub
    }

    pub async fn start(&self) -> Result<(), ModuleError> {
        for module in &self.modules {
            module.start().await?;
            info!(module = module.name(), "module started");
        }
        Ok(())
    }

    pub async fn stop(&self) {
        for module in self.modules.iter().rev() {
            if let Err(e) = module.stop().await {
                error!(module = module.name(), error = %e, "failed to stop module");
            }
        }
    }

    pub fn server_features(&self) -> Vec<&'static str> {
        self.collect_features(|m| m.server_features())
    }

    pub fn account_features(&self) -> Vec<&'static str> {
        self.collect_features(|m| m.account_features())
    }

    fn collect_features(&self, f: impl Fn(&dyn Module) -> Vec<&'static str>) -> Vec<&'static str> {
        let mut features: Vec<&'static str> = Vec::new();
        for module in &self.modules {
            for feature in f(module.as_ref()) {
                if !features.contains(&feature) {
                    features.push(feature);
                }
            }
        }
        features
    }

    /// Stream features contributed by modules after authentication.
    pub fn stream_features(&self, domain: &str) -> Vec<Element> {
        self.modules
            .iter()
            .filter_map(|m| m.stream_feature(domain))
            .collect()
    }

    /// Dispatches a get/set IQ to the first module claiming its namespace.
    pub async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) {
        let namespace = iq.payload().map(|p| p.namespace()).unwrap_or("");
        let server_target = iq.to().is_server();
        let Some(module) = self
            .modules
            .iter()
            .find(|m| m.matches_namespace(namespace, server_target))
        else {
            stream.reply(iq.make_error(StanzaErrorCondition::ServiceUnavailable));
            return;
        };
        match module.process_iq(stream, iq).await {
            Ok(()) => {}
            Err(ModuleError::Stanza(condition)) => stream.reply(iq.make_error(condition)),
            Err(e) => {
                error!(module = module.name(), id = iq.id(), error = %e, "iq processing failed");
                stream.reply(iq.make_error(StanzaErrorCondition::InternalServerError));
            }
        }
    }

    /// Offers a result or error IQ addressed to the server to the modules
    /// that issue server-side requests. Returns whether one consumed it.
    pub async fn process_result(&self, stream: &StreamHandle, iq: &Iq) -> bool {
        if let Some(ping) = &self.ping {
            if ping.process_result(stream, iq) {
                return true;
            }
        }
        if let Some(caps) = &self.caps {
            match caps.process_result(iq).await {
                Ok(consumed) => return consumed,
                Err(e) => {
                    error!(id = iq.id(), error = %e, "failed to store capabilities");
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::host::Hosts;
    use crate::jid::Jid;
    use crate::router::registry::tests::{test_stream, TestStream};
    use crate::storage::{MemoryRepository, User, UserRepository};
    use crate::xml::parser::parse_element;
    use crate::xml::{Presence, Stanza};

    pub(crate) async fn test_router(users: &[&str]) -> Router {
        let repo = Arc::new(MemoryRepository::new());
        for user in users {
            repo.upsert_user(&User::new(user, "1234")).await.unwrap();
        }
        Router::new(Hosts::from_names(&["jackal.im"]), repo)
    }

    /// Registered, authenticated stream with an available presence.
    pub(crate) fn online_stream(router: &Router, id: &str, jid: &str) -> TestStream {
        let s = test_stream(id, jid, 16);
        let full: Jid = jid.parse().unwrap();
        let presence = Presence::new(Element::new("presence"), &full, &full.to_bare());
        s.handle.update_context(|c| c.presence = Some(presence));
        router.registry().register(&s.handle).unwrap();
        router.registry().authenticate(&s.handle).unwrap();
        s
    }

    /// Parses `xml` as an IQ sent by `stream`, defaulting `to` to the sender's
    /// bare JID.
    pub(crate) fn iq_from(stream: &StreamHandle, xml: &str) -> Iq {
        let elem = parse_element(xml).unwrap();
        let from = stream.jid().unwrap();
        let to = match elem.get_attr("to") {
            Some(to) => to.parse().unwrap(),
            None => from.to_bare(),
        };
        match Stanza::from_element(elem, &from, &to).unwrap().unwrap() {
            Stanza::Iq(iq) => iq,
            other => panic!("not an iq: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unclaimed_namespace_is_service_unavailable() {
        let router = test_router(&["ortuman"]).await;
        let hub = Hub::new(&ModulesConfig::default(), router.clone());
        let mut s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let iq = iq_from(
            &s.handle,
            r#"<iq id="q1" type="get" to="jackal.im"><query xmlns="urn:example:unknown"/></iq>"#,
        );
        hub.process_iq(&s.handle, &iq).await;
        let reply = s.try_next().unwrap();
        assert_eq!(reply.type_attr(), "error");
        assert!(reply
            .find("error")
            .unwrap()
            .find("service-unavailable")
            .is_some());
    }

    #[tokio::test]
    async fn test_features_are_aggregated_without_duplicates() {
        let router = test_router(&[]).await;
        let hub = Hub::new(&ModulesConfig::default(), router);
        let features = hub.server_features();
        for ns in [
            crate::xml::ns::PING,
            crate::xml::ns::VERSION,
            crate::xml::ns::BLOCKING,
            crate::xml::ns::DISCO_INFO,
        ] {
            assert!(features.contains(&ns), "missing {ns}");
        }
        let mut sorted = features.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), features.len());
    }

    /// Answers every IQ in its namespace with an empty `<claimed/>` result.
    struct Claiming(&'static str);

    #[async_trait]
    impl Module for Claiming {
        fn name(&self) -> &'static str {
            "claiming"
        }

        fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
            namespace == self.0
        }

        async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
            stream.reply(iq.result_with(Element::new("claimed")));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_first_matching_module_handles_iq() {
        let router = test_router(&["ortuman"]).await;
        let config = ModulesConfig {
            enabled: vec![ModuleName::Version],
            ..Default::default()
        };
        let mut hub = Hub::new(&config, router.clone());
        hub.modules.insert(0, Arc::new(Claiming(crate::xml::ns::VERSION)));
        let mut s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let iq = iq_from(
            &s.handle,
            r#"<iq id="v1" type="get" to="jackal.im"><query xmlns="jabber:iq:version"/></iq>"#,
        );

        hub.process_iq(&s.handle, &iq).await;
        let reply = s.try_next().unwrap();
        assert_eq!(reply.type_attr(), "result");
        assert!(reply.find("claimed").is_some());
        assert!(s.try_next().is_none());

        // With the claiming module last, the version module answers instead.
        let claiming = hub.modules.remove(0);
        hub.modules.push(claiming);
        hub.process_iq(&s.handle, &iq).await;
        let reply = s.try_next().unwrap();
        assert!(reply.find("claimed").is_none());
        assert!(reply.find_ns("query", crate::xml::ns::VERSION).is_some());
        assert!(s.try_next().is_none());
    }

    #[tokio::test]
    async fn test_disabled_modules_are_absent() {
        let router = test_router(&[]).await;
        let config = ModulesConfig {
            enabled: vec![ModuleName::Ping],
            ..Default::default()
        };
        let hub = Hub::new(&config, router);
        assert!(hub.ping.is_some());
        assert!(hub.roster.is_none());
        assert!(hub.offline.is_none());
        assert_eq!(hub.server_features(), vec![crate::xml::ns::PING]);
    }
}
