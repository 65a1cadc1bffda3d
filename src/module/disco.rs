//! XEP-0030: Service Discovery for the server and its accounts.

use async_trait::async_trait;

use super::Module;
use crate::error::ModuleError;
use crate::router::{Router, StreamHandle};
use crate::storage::{RosterRepository, UserRepository};
use crate::xml::{ns, Element, Iq, StanzaErrorCondition};

/// Features of the discovery module itself.
pub const FEATURES: [&str; 2] = [ns::DISCO_INFO, ns::DISCO_ITEMS];

pub struct Disco {
    router: Router,
    server_features: Vec<&'static str>,
    account_features: Vec<&'static str>,
}

impl Disco {
    pub fn new(
        router: Router,
        server_features: Vec<&'static str>,
        account_features: Vec<&'static str>,
    ) -> Self {
        Self {
            router,
            server_features,
            account_features,
        }
    }

    fn info(identity: Element, features: &[&'static str]) -> Element {
        Element::with_ns("query", ns::DISCO_INFO)
            .child(identity)
            .children_from(features.iter().map(|f| Element::new("feature").attr("var", *f)))
    }

    async fn account_info(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        let username = iq.to().node();
        if !self.router.repository().user_exists(username).await? {
            return Err(ModuleError::Stanza(StanzaErrorCondition::ItemNotFound));
        }
        let identity = Element::new("identity")
            .attr("category", "account")
            .attr("type", "registered");
        stream.reply(iq.result_with(Self::info(identity, &self.account_features)));
        Ok(())
    }

    /// Available resources of the account, visible to the owner and to
    /// contacts subscribed to its presence.
    async fn account_items(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        let to = iq.to();
        let requester = stream.username();
        let visible = requester == to.node()
            || self
                .router
                .repository()
                .fetch_roster_item(&requester, &to.bare_string())
                .await?
                .is_some_and(|i| i.subscription.receives_presence());

        let mut query = Element::with_ns("query", ns::DISCO_ITEMS);
        if visible {
            for s in self.router.registry().user_streams(to.node()) {
                if let Some(jid) = s.jid().filter(|_| s.is_available()) {
                    query.append(Element::new("item").attr("jid", jid.to_string()));
                }
            }
        }
        stream.reply(iq.result_with(query));
        Ok(())
    }
}

#[async_trait]
impl Module for Disco {
    fn name(&self) -> &'static str {
        "disco"
    }

    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::DISCO_INFO || namespace == ns::DISCO_ITEMS
    }

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        let Some(query) = iq.payload().filter(|_| iq.is_get()) else {
            return Err(ModuleError::Stanza(StanzaErrorCondition::BadRequest));
        };
        if !query.attr_str("node").is_empty() {
            return Err(ModuleError::Stanza(StanzaErrorCondition::ItemNotFound));
        }
        let server_target = iq.to().is_server();
        match (query.namespace(), server_target) {
            (ns::DISCO_INFO, true) => {
                let identity = Element::new("identity")
                    .attr("category", "server")
                    .attr("type", "im")
                    .attr("name", "jackal");
                stream.reply(iq.result_with(Self::info(identity, &self.server_features)));
                Ok(())
            }
            (ns::DISCO_ITEMS, true) => {
                stream.reply(iq.result_with(Element::with_ns("query", ns::DISCO_ITEMS)));
                Ok(())
            }
            (ns::DISCO_INFO, false) => self.account_info(stream, iq).await,
            _ => self.account_items(stream, iq).await,
        }
    }
}
