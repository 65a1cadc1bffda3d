//! XEP-0160: offline message storage.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};

use super::Module;
use crate::c2s::context::Once;
use crate::error::ModuleError;
use crate::router::{Router, StreamHandle};
use crate::storage::OfflineRepository;
use crate::xml::{ns, Element, Iq, Message, StanzaErrorCondition};

pub struct Offline {
    router: Router,
    queue_size: usize,
}

impl Offline {
    pub fn new(router: Router, queue_size: usize) -> Self {
        Self { router, queue_size }
    }

    /// Queues `message` for its unavailable recipient. Messages without a
    /// body are dropped.
    pub async fn archive_message(&self, message: &Message) -> Result<(), ModuleError> {
        if !message.is_message_with_body() {
            return Ok(());
        }
        let username = message.to().node();
        let repo = self.router.repository();
        if repo.count_offline_messages(username).await? >= self.queue_size {
            return Err(ModuleError::Stanza(StanzaErrorCondition::ServiceUnavailable));
        }
        let mut elem = message.element().clone();
        elem.append(
            Element::with_ns("delay", ns::DELAY)
                .attr("from", message.to().domain())
                .attr("stamp", Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
                .text("Offline Storage"),
        );
        repo.insert_offline_message(&elem, username).await?;
        info!(username, id = message.id(), "message archived");
        Ok(())
    }

    /// Drains the offline queue into `stream`, once per session and only
    /// for a non-negative priority.
    pub async fn deliver(&self, stream: &StreamHandle) -> Result<(), ModuleError> {
        let ready = stream.update_context(|c| {
            c.is_available() && c.priority() >= 0 && c.take_once(Once::OfflineDelivery)
        });
        if !ready {
            return Ok(());
        }
        let username = stream.username();
        let repo = self.router.repository();
        let messages = repo.fetch_offline_messages(&username).await?;
        if messages.is_empty() {
            return Ok(());
        }
        info!(username = %username, count = messages.len(), "delivering offline messages");
        for message in messages {
            if let Err(e) = stream.deliver(message).await {
                warn!(stream_id = %stream.id(), error = %e, "offline delivery failed");
            }
        }
        repo.delete_offline_messages(&username).await?;
        Ok(())
    }
}

#[async_trait]
impl Module for Offline {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::OFFLINE]
    }

    fn matches_namespace(&self, _namespace: &str, _server_target: bool) -> bool {
        false
    }

    async fn process_iq(&self, _stream: &StreamHandle, _iq: &Iq) -> Result<(), ModuleError> {
        Ok(())
    }
}
