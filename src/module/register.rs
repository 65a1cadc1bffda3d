//! XEP-0077: In-Band Registration.

use async_trait::async_trait;
use tracing::info;

use super::Module;
use crate::config::RegistrationConfig;
use crate::error::ModuleError;
use crate::router::{Router, StreamHandle};
use crate::storage::{
    transaction, BlockListRepository, LastRepository, OfflineRepository, PrivateRepository,
    RosterRepository, User, UserRepository, VCardRepository,
};
use crate::xml::{ns, Element, Iq, StanzaErrorCondition};

pub struct Register {
    router: Router,
    config: RegistrationConfig,
}

fn stanza_error(condition: StanzaErrorCondition) -> ModuleError {
    ModuleError::Stanza(condition)
}

/// Reply for a stream that has no JID yet.
fn anonymous(mut reply: Element) -> Element {
    reply.remove_attr("from");
    reply.remove_attr("to");
    reply
}

impl Register {
    pub fn new(router: Router, config: RegistrationConfig) -> Self {
        Self { router, config }
    }

    /// Feature offered to secured streams before authentication.
    pub fn feature(&self) -> Element {
        Element::with_ns("register", ns::REGISTER_FEATURE)
    }

    /// Handles a registration request on a stream that has not
    /// authenticated yet.
    pub async fn process_unauthenticated(
        &self,
        stream: &StreamHandle,
        iq: &Iq,
    ) -> Result<(), ModuleError> {
        let query = iq
            .payload()
            .filter(|q| q.name() == "query" && q.namespace() == ns::REGISTER)
            .ok_or(stanza_error(StanzaErrorCondition::BadRequest))?;

        if iq.is_get() {
            if !self.config.allow_registration {
                return Err(stanza_error(StanzaErrorCondition::NotAllowed));
            }
            let form = Element::with_ns("query", ns::REGISTER)
                .child(Element::new("username"))
                .child(Element::new("password"));
            stream.reply(anonymous(iq.result_with(form)));
            return Ok(());
        }
        if !iq.is_set() {
            return Err(stanza_error(StanzaErrorCondition::BadRequest));
        }
        if stream.with_context(|c| c.registered) {
            return Err(stanza_error(StanzaErrorCondition::NotAcceptable));
        }
        if !self.config.allow_registration {
            return Err(stanza_error(StanzaErrorCondition::NotAllowed));
        }
        let username = query.find("username").map(|e| e.get_text()).unwrap_or("");
        let password = query.find("password").map(|e| e.get_text()).unwrap_or("");
        if username.is_empty() || password.is_empty() {
            return Err(stanza_error(StanzaErrorCondition::BadRequest));
        }
        let username = username.to_lowercase();
        let repo = self.router.repository();
        if repo.user_exists(&username).await? {
            return Err(stanza_error(StanzaErrorCondition::Conflict));
        }
        repo.upsert_user(&User::new(&username, password)).await?;
        stream.update_context(|c| c.registered = true);
        info!(username = %username, "account registered");
        stream.reply(anonymous(iq.result_iq()));
        Ok(())
    }

    async fn cancel_registration(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        if !self.config.allow_cancel {
            return Err(stanza_error(StanzaErrorCondition::NotAllowed));
        }
        let username = stream.username();
        let owned = username.clone();
        self.router
            .repository()
            .in_transaction(transaction(move |tx| {
                Box::pin(async move {
                    tx.delete_roster(&owned).await?;
                    tx.delete_vcard(&owned).await?;
                    tx.delete_private(&owned).await?;
                    tx.delete_offline_messages(&owned).await?;
                    tx.delete_block_list_items(&owned).await?;
                    tx.delete_last(&owned).await?;
                    tx.delete_user(&owned).await
                })
            }))
            .await?;
        info!(username = %username, "account cancelled");
        stream.reply(iq.result_iq());
        stream.disconnect(None);
        Ok(())
    }

    async fn change_password(
        &self,
        stream: &StreamHandle,
        iq: &Iq,
        query: &Element,
    ) -> Result<(), ModuleError> {
        let username = query.find("username").map(|e| e.get_text()).unwrap_or("");
        let password = query.find("password").map(|e| e.get_text()).unwrap_or("");
        if username.is_empty() || password.is_empty() {
            return Err(stanza_error(StanzaErrorCondition::BadRequest));
        }
        if !self.config.allow_change {
            return Err(stanza_error(StanzaErrorCondition::NotAllowed));
        }
        let (owner, secured) = stream.with_context(|c| (c.username.clone(), c.secured));
        if username != owner {
            return Err(stanza_error(StanzaErrorCondition::NotAllowed));
        }
        if !secured {
            return Err(stanza_error(StanzaErrorCondition::NotAuthorized));
        }
        self.router
            .repository()
            .upsert_user(&User::new(&owner, password))
            .await?;
        info!(username = %owner, "password changed");
        stream.reply(iq.result_iq());
        Ok(())
    }
}

#[async_trait]
impl Module for Register {
    fn name(&self) -> &'static str {
        "registration"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::REGISTER]
    }

    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::REGISTER
    }

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        let to = iq.to();
        if !to.is_server() && to.node() != stream.username() {
            return Err(stanza_error(StanzaErrorCondition::Forbidden));
        }
        let Some(query) = iq.payload() else {
            return Err(stanza_error(StanzaErrorCondition::BadRequest));
        };
        if iq.is_get() {
            if !query.elements().is_empty() {
                return Err(stanza_error(StanzaErrorCondition::BadRequest));
            }
            let registered = Element::with_ns("query", ns::REGISTER)
                .child(Element::new("registered"))
                .child(Element::new("username").text(stream.username()));
            stream.reply(iq.result_with(registered));
            return Ok(());
        }
        if query.find("remove").is_some() {
            self.cancel_registration(stream, iq).await
        } else {
            self.change_password(stream, iq, query).await
        }
    }
}
