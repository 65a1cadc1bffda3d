//! XEP-0115: Entity Capabilities.
//!
//! Capabilities announced in presence are resolved once per `(node, ver)`
//! with a disco#info query to the announcing resource.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::Module;
use crate::error::ModuleError;
use crate::router::{Router, StreamHandle};
use crate::storage::{Capabilities, CapabilitiesRepository};
use crate::xml::{ns, Element, Iq, Presence};

pub struct EntityCaps {
    router: Router,
    /// Outstanding disco#info requests by IQ id.
    pending: Mutex<HashMap<String, (String, String)>>,
}

impl EntityCaps {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Queries the sender of `presence` when its capabilities are unknown.
    pub async fn process_presence(
        &self,
        stream: &StreamHandle,
        presence: &Presence,
    ) -> Result<(), ModuleError> {
        if !presence.is_available() {
            return Ok(());
        }
        let Some(caps) = presence.caps() else {
            return Ok(());
        };
        if self
            .router
            .repository()
            .capabilities_exist(&caps.node, &caps.ver)
            .await?
        {
            return Ok(());
        }
        let already_asked = self
            .pending
            .lock()
            .values()
            .any(|(node, ver)| *node == caps.node && *ver == caps.ver);
        if already_asked {
            return Ok(());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let query = Element::new("iq")
            .attr("id", id.as_str())
            .attr("type", "get")
            .attr("from", stream.domain())
            .attr("to", presence.from().to_string())
            .child(
                Element::with_ns("query", ns::DISCO_INFO)
                    .attr("node", format!("{}#{}", caps.node, caps.ver)),
            );
        debug!(node = %caps.node, ver = %caps.ver, "requesting capabilities");
        self.pending.lock().insert(id, (caps.node, caps.ver));
        stream.deliver(query).await?;
        Ok(())
    }

    /// Stores the features of a disco#info answer this module asked for.
    pub async fn process_result(&self, iq: &Iq) -> Result<bool, ModuleError> {
        let Some((node, ver)) = self.pending.lock().remove(iq.id()) else {
            return Ok(false);
        };
        if !iq.is_result() {
            return Ok(true);
        }
        let Some(query) = iq.element().find_ns("query", ns::DISCO_INFO) else {
            return Ok(true);
        };
        let features = query
            .find_all("feature")
            .map(|f| f.attr_str("var").to_string())
            .filter(|f| !f.is_empty())
            .collect();
        info!(node = %node, ver = %ver, "capabilities stored");
        self.router
            .repository()
            .upsert_capabilities(&Capabilities { node, ver, features })
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl Module for EntityCaps {
    fn name(&self) -> &'static str {
        "caps"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::CAPS]
    }

    fn matches_namespace(&self, _namespace: &str, _server_target: bool) -> bool {
        false
    }

    async fn process_iq(&self, _stream: &StreamHandle, _iq: &Iq) -> Result<(), ModuleError> {
        Ok(())
    }
}
