//! XEP-0012: Last Activity.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use super::Module;
use crate::error::ModuleError;
use crate::router::{Router, StreamHandle};
use crate::storage::{LastRepository, RosterRepository};
use crate::xml::{ns, Element, Iq, StanzaErrorCondition};

pub struct LastActivity {
    router: Router,
    started_at: Instant,
}

impl LastActivity {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            started_at: Instant::now(),
        }
    }

    fn query(seconds: u64, status: &str) -> Element {
        Element::with_ns("query", ns::LAST)
            .attr("seconds", seconds.to_string())
            .text(status)
    }

    /// The requester may see the target's activity when it is the same
    /// account or it is subscribed to the target's presence.
    async fn is_allowed(&self, stream: &StreamHandle, target: &str) -> Result<bool, ModuleError> {
        let username = stream.username();
        if username == target {
            return Ok(true);
        }
        let target_jid = format!("{}@{}", target, stream.domain());
        let item = self
            .router
            .repository()
            .fetch_roster_item(&username, &target_jid)
            .await?;
        Ok(item.is_some_and(|i| i.subscription.receives_presence()))
    }
}

#[async_trait]
impl Module for LastActivity {
    fn name(&self) -> &'static str {
        "last_activity"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::LAST]
    }

    fn account_features(&self) -> Vec<&'static str> {
        vec![ns::LAST]
    }

    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::LAST
    }

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        if !iq.is_get() {
            return Err(ModuleError::Stanza(StanzaErrorCondition::BadRequest));
        }
        let to = iq.to();
        if to.is_server() {
            let uptime = self.started_at.elapsed().as_secs();
            stream.reply(iq.result_with(Self::query(uptime, "")));
            return Ok(());
        }

        let target = to.node();
        if !self.is_allowed(stream, target).await? {
            return Err(ModuleError::Stanza(StanzaErrorCondition::Forbidden));
        }
        let online = self
            .router
            .registry()
            .user_streams(target)
            .iter()
            .any(|s| s.is_available());
        if online {
            stream.reply(iq.result_with(Self::query(0, "")));
            return Ok(());
        }
        match self.router.repository().fetch_last(target).await? {
            Some(last) => {
                let seconds = (Utc::now() - last.logged_out_at).num_seconds().max(0) as u64;
                stream.reply(iq.result_with(Self::query(seconds, &last.status)));
                Ok(())
            }
            None => Err(ModuleError::Stanza(StanzaErrorCondition::ItemNotFound)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::tests::{iq_from, online_stream, test_router};
    use crate::storage::{Last, RosterItem, Subscription};
    use chrono::Duration;

    const LAST_GET: &str =
        r#"<iq id="l1" type="get" to="noelia@jackal.im"><query xmlns="jabber:iq:last"/></iq>"#;

    async fn subscribe(router: &Router, subscription: Subscription) {
        router
            .repository()
            .upsert_roster_item(&RosterItem {
                username: "ortuman".to_string(),
                jid: "noelia@jackal.im".to_string(),
                name: String::new(),
                subscription,
                ask: false,
                groups: Vec::new(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_uptime() {
        let router = test_router(&["ortuman"]).await;
        let mut s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let iq = iq_from(
            &s.handle,
            r#"<iq id="l1" type="get" to="jackal.im"><query xmlns="jabber:iq:last"/></iq>"#,
        );
        LastActivity::new(router).process_iq(&s.handle, &iq).await.unwrap();
        let reply = s.try_next().unwrap();
        let query = reply.find_ns("query", ns::LAST).unwrap();
        assert_eq!(query.attr_str("seconds"), "0");
    }

    #[tokio::test]
    async fn test_offline_contact() {
        let router = test_router(&["ortuman", "noelia"]).await;
        subscribe(&router, Subscription::Both).await;
        router
            .repository()
            .upsert_last(&Last {
                username: "noelia".to_string(),
                logged_out_at: Utc::now() - Duration::seconds(120),
                status: "Gone fishing".to_string(),
            })
            .await
            .unwrap();

        let mut s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let iq = iq_from(&s.handle, LAST_GET);
        LastActivity::new(router).process_iq(&s.handle, &iq).await.unwrap();
        let reply = s.try_next().unwrap();
        let query = reply.find_ns("query", ns::LAST).unwrap();
        let seconds: u64 = query.attr_str("seconds").parse().unwrap();
        assert!((120..130).contains(&seconds));
        assert_eq!(query.get_text(), "Gone fishing");
    }

    #[tokio::test]
    async fn test_online_contact_reports_zero() {
        let router = test_router(&["ortuman", "noelia"]).await;
        subscribe(&router, Subscription::To).await;
        let _n = online_stream(&router, "s2", "noelia@jackal.im/garden");
        let mut s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let iq = iq_from(&s.handle, LAST_GET);
        LastActivity::new(router).process_iq(&s.handle, &iq).await.unwrap();
        let reply = s.try_next().unwrap();
        assert_eq!(reply.find_ns("query", ns::LAST).unwrap().attr_str("seconds"), "0");
    }

    #[tokio::test]
    async fn test_unsubscribed_requester_is_forbidden() {
        let router = test_router(&["ortuman", "noelia"]).await;
        subscribe(&router, Subscription::From).await;
        let s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let iq = iq_from(&s.handle, LAST_GET);
        assert!(matches!(
            LastActivity::new(router).process_iq(&s.handle, &iq).await,
            Err(ModuleError::Stanza(StanzaErrorCondition::Forbidden))
        ));
    }

    #[tokio::test]
    async fn test_missing_record_is_item_not_found() {
        let router = test_router(&["ortuman", "noelia"]).await;
        subscribe(&router, Subscription::Both).await;
        let s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let iq = iq_from(&s.handle, LAST_GET);
        assert!(matches!(
            LastActivity::new(router).process_iq(&s.handle, &iq).await,
            Err(ModuleError::Stanza(StanzaErrorCondition::ItemNotFound))
        ));
    }
}
