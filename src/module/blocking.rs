//! XEP-0191: Blocking Command.

use async_trait::async_trait;
use tracing::{debug, warn};

use super::Module;
use crate::error::ModuleError;
use crate::jid::Jid;
use crate::router::{matches_block_pattern, Router, StreamHandle};
use crate::storage::{BlockListItem, BlockListRepository, RosterRepository};
use crate::xml::{ns, Element, Iq, Presence, StanzaErrorCondition};

pub struct BlockingCommand {
    router: Router,
}

impl BlockingCommand {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    async fn send_blocklist(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        let items = self
            .router
            .repository()
            .fetch_block_list_items(&stream.username())
            .await?;
        stream.update_context(|c| c.blocklist_requested = true);
        let list = Element::with_ns("blocklist", ns::BLOCKING).children_from(
            items
                .iter()
                .map(|i| Element::new("item").attr("jid", i.jid.as_str())),
        );
        stream.reply(iq.result_with(list));
        Ok(())
    }

    async fn block(&self, stream: &StreamHandle, iq: &Iq, cmd: &Element) -> Result<(), ModuleError> {
        let jids = parse_items(cmd)?;
        if jids.is_empty() {
            return Err(ModuleError::Stanza(StanzaErrorCondition::BadRequest));
        }
        let username = stream.username();
        let repo = self.router.repository();
        for jid in &jids {
            repo.upsert_block_list_item(&BlockListItem {
                username: username.clone(),
                jid: jid.to_string(),
            })
            .await?;
        }
        stream.reply(iq.result_iq());

        self.notify_contacts(stream, &jids, true).await?;
        self.push(stream, "block", &jids).await;
        Ok(())
    }

    async fn unblock(&self, stream: &StreamHandle, iq: &Iq, cmd: &Element) -> Result<(), ModuleError> {
        let mut jids = parse_items(cmd)?;
        let username = stream.username();
        let repo = self.router.repository();
        if jids.is_empty() {
            for item in repo.fetch_block_list_items(&username).await? {
                if let Ok(jid) = item.jid.parse() {
                    jids.push(jid);
                }
            }
            repo.delete_block_list_items(&username).await?;
        } else {
            for jid in &jids {
                repo.delete_block_list_item(&BlockListItem {
                    username: username.clone(),
                    jid: jid.to_string(),
                })
                .await?;
            }
        }
        stream.reply(iq.result_iq());

        self.notify_contacts(stream, &jids, false).await?;
        self.push(stream, "unblock", &jids).await;
        Ok(())
    }

    /// Presence subscribers covered by `patterns` stop (or resume) seeing
    /// the owner's available resources.
    async fn notify_contacts(
        &self,
        stream: &StreamHandle,
        patterns: &[Jid],
        blocked: bool,
    ) -> Result<(), ModuleError> {
        let username = stream.username();
        let items = self.router.repository().fetch_roster_items(&username).await?;
        let own = self.router.registry().user_streams(&username);
        for item in items.iter().filter(|i| i.subscription.sends_presence()) {
            let Ok(contact) = item.jid.parse::<Jid>() else {
                continue;
            };
            for target in self.router.registry().user_streams(contact.node()) {
                let Some(target_jid) = target.jid() else {
                    continue;
                };
                if target_jid.domain() != contact.domain()
                    || !patterns
                        .iter()
                        .any(|p| matches_block_pattern(&target_jid, &p.to_string()))
                {
                    continue;
                }
                for resource in own.iter() {
                    let Some(presence) = resource.with_context(|c| {
                        c.presence.clone().filter(|p| p.is_available())
                    }) else {
                        continue;
                    };
                    let from = presence.from().clone();
                    let elem = if blocked {
                        Presence::with_type(&from, &target_jid, "unavailable").into_element()
                    } else {
                        presence.with_addresses(&from, &target_jid).into_element()
                    };
                    if let Err(e) = target.deliver(elem).await {
                        warn!(stream_id = %target.id(), error = %e, "presence delivery failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn push(&self, stream: &StreamHandle, command: &str, jids: &[Jid]) {
        let username = stream.username();
        for target in self.router.registry().user_streams(&username) {
            let Some(jid) = target.jid() else {
                continue;
            };
            if !target.with_context(|c| c.blocklist_requested) {
                continue;
            }
            let push = Element::new("iq")
                .attr("id", uuid::Uuid::new_v4().to_string())
                .attr("type", "set")
                .attr("from", jid.bare_string())
                .attr("to", jid.to_string())
                .child(
                    Element::with_ns(command, ns::BLOCKING).children_from(
                        jids.iter()
                            .map(|j| Element::new("item").attr("jid", j.to_string())),
                    ),
                );
            debug!(stream_id = %target.id(), command, "pushing block list change");
            if let Err(e) = target.deliver(push).await {
                warn!(stream_id = %target.id(), error = %e, "block list push failed");
            }
        }
    }
}

fn parse_items(cmd: &Element) -> Result<Vec<Jid>, ModuleError> {
    cmd.find_all("item")
        .map(|item| {
            item.attr_str("jid")
                .parse::<Jid>()
                .map_err(|_| ModuleError::Stanza(StanzaErrorCondition::JidMalformed))
        })
        .collect()
}

#[async_trait]
impl Module for BlockingCommand {
    fn name(&self) -> &'static str {
        "blocking_command"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::BLOCKING]
    }

    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::BLOCKING
    }

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        if iq.to().node() != stream.username() && !iq.to().is_server() {
            return Err(ModuleError::Stanza(StanzaErrorCondition::Forbidden));
        }
        let Some(payload) = iq.payload() else {
            return Err(ModuleError::Stanza(StanzaErrorCondition::BadRequest));
        };
        match (iq.type_attr(), payload.name()) {
            ("get", "blocklist") => self.send_blocklist(stream, iq).await,
            ("set", "block") => self.block(stream, iq, payload).await,
            ("set", "unblock") => self.unblock(stream, iq, payload).await,
            _ => Err(ModuleError::Stanza(StanzaErrorCondition::BadRequest)),
        }
    }
}
