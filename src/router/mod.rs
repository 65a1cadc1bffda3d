//! Local stanza routing.
//!
//! The router resolves a recipient JID against the C2S registry and queues
//! the stanza in the mailboxes of the matching streams. It never writes to a
//! transport itself.

pub mod registry;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::RouteError;
use crate::host::Hosts;
use crate::jid::Jid;
use crate::storage::{BlockListRepository, Repository, UserRepository};
use crate::xml::Stanza;

pub use registry::{Registry, StreamCommand, StreamHandle, MAILBOX_SEND_TIMEOUT};

struct Inner {
    hosts: Hosts,
    registry: Registry,
    repo: Arc<dyn Repository>,
}

/// Block-list forms of `jid`, most specific first.
fn block_forms(jid: &Jid) -> Vec<String> {
    let mut forms = Vec::with_capacity(4);
    if jid.is_full() {
        forms.push(jid.to_string());
    }
    if !jid.node().is_empty() {
        forms.push(jid.bare_string());
    }
    if !jid.resource().is_empty() {
        forms.push(format!("{}/{}", jid.domain(), jid.resource()));
    }
    forms.push(jid.domain().to_string());
    forms
}

/// Whether the block-list entry `pattern` covers `jid`.
pub fn matches_block_pattern(jid: &Jid, pattern: &str) -> bool {
    block_forms(jid).iter().any(|form| form == pattern)
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    pub fn new(hosts: Hosts, repo: Arc<dyn Repository>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Registry::new(hosts.clone()),
                hosts,
                repo,
            }),
        }
    }

    pub fn hosts(&self) -> &Hosts {
        &self.inner.hosts
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.inner.repo
    }

    /// Delivers `stanza` to its local recipient.
    ///
    /// Bare recipients get messages on the highest-priority available
    /// resource (latest authenticated on ties); presences and IQs are
    /// broadcast to every available resource.
    pub async fn route(&self, stanza: &Stanza) -> Result<(), RouteError> {
        let to = stanza.to();
        if !self.inner.hosts.is_local_host(to.domain()) {
            return Err(RouteError::NotLocalDomain(to.domain().to_string()));
        }
        let username = to.node();
        if username.is_empty() || !self.inner.repo.user_exists(username).await? {
            return Err(RouteError::NotExistingAccount);
        }
        if self.is_blocked_jid(stanza.from(), username).await? {
            return Err(RouteError::BlockedJid);
        }

        let streams = self.inner.registry.user_streams(username);
        if streams.is_empty() {
            return Err(RouteError::NotAuthenticated);
        }

        if to.is_full() {
            let target = streams
                .iter()
                .find(|s| s.with_context(|c| c.resource == to.resource()));
            return match target {
                Some(stream) => stream.deliver(stanza.element().clone()).await,
                None => Err(RouteError::ResourceNotFound),
            };
        }

        match stanza {
            Stanza::Message(_) => {
                let mut best: Option<(&StreamHandle, i8)> = None;
                for stream in &streams {
                    let (available, priority) =
                        stream.with_context(|c| (c.is_available(), c.priority()));
                    if !available || priority < 0 {
                        continue;
                    }
                    if best.map_or(true, |(_, p)| priority >= p) {
                        best = Some((stream, priority));
                    }
                }
                match best {
                    Some((stream, _)) => stream.deliver(stanza.element().clone()).await,
                    None => Err(RouteError::NotAuthenticated),
                }
            }
            Stanza::Presence(_) | Stanza::Iq(_) => {
                let available: Vec<_> = streams.iter().filter(|s| s.is_available()).collect();
                if available.is_empty() {
                    return Err(RouteError::NotAuthenticated);
                }
                for stream in available {
                    if let Err(e) = stream.deliver(stanza.element().clone()).await {
                        warn!(stream_id = %stream.id(), error = %e, "broadcast delivery failed");
                    }
                }
                Ok(())
            }
        }
    }

    /// Whether `jid` matches a block-list pattern of `username`. Patterns are
    /// tried from the most specific form: full, bare, domain/resource, domain.
    pub async fn is_blocked_jid(&self, jid: &Jid, username: &str) -> Result<bool, RouteError> {
        let items = self.inner.repo.fetch_block_list_items(username).await?;
        if items.is_empty() {
            return Ok(false);
        }
        let blocked = items.iter().any(|item| matches_block_pattern(jid, &item.jid));
        if blocked {
            debug!(jid = %jid, username, "jid is blocked");
        }
        Ok(blocked)
    }

    /// Registered streams whose bound JID matches `jid`; empty node or
    /// resource parts act as wildcards.
    pub fn streams_matching_jid(&self, jid: &Jid) -> Vec<StreamHandle> {
        self.inner
            .registry
            .all_streams()
            .into_iter()
            .filter(|s| {
                s.with_context(|c| match &c.jid {
                    Some(bound) => {
                        bound.domain() == jid.domain()
                            && (jid.node().is_empty() || bound.node() == jid.node())
                            && (jid.resource().is_empty() || bound.resource() == jid.resource())
                    }
                    None => false,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::registry::tests::{test_stream, TestStream};
    use super::*;
    use crate::storage::{BlockListItem, MemoryRepository, User};
    use crate::xml::{Element, Presence};

    async fn router() -> Router {
        let repo = Arc::new(MemoryRepository::new());
        for user in ["ortuman", "noelia", "hamlet"] {
            repo.upsert_user(&User::new(user, "1234")).await.unwrap();
        }
        Router::new(Hosts::from_names(&["jackal.im"]), repo)
    }

    fn online(router: &Router, id: &str, jid: &str, priority: i8) -> TestStream {
        let s = test_stream(id, jid, 8);
        let full: Jid = jid.parse().unwrap();
        let presence = Presence::new(
            Element::new("presence").child(Element::new("priority").text(priority.to_string())),
            &full,
            &full.to_bare(),
        );
        s.handle.update_context(|c| c.presence = Some(presence));
        router.registry().register(&s.handle).unwrap();
        router.registry().authenticate(&s.handle).unwrap();
        s
    }

    fn message(from: &str, to: &str) -> Stanza {
        let from: Jid = from.parse().unwrap();
        let to: Jid = to.parse().unwrap();
        let elem = Element::new("message")
            .attr("type", "chat")
            .child(Element::new("body").text("hi"));
        Stanza::from_element(elem, &from, &to).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_message_goes_to_highest_priority() {
        let router = router().await;
        let mut low = online(&router, "s1", "noelia@jackal.im/a", 1);
        let mut high = online(&router, "s2", "noelia@jackal.im/b", 5);
        let mut tied = online(&router, "s3", "noelia@jackal.im/c", 5);

        router
            .route(&message("ortuman@jackal.im/balcony", "noelia@jackal.im"))
            .await
            .unwrap();
        assert!(low.try_next().is_none());
        assert!(high.try_next().is_none());
        assert!(tied.try_next().is_some());
    }

    #[tokio::test]
    async fn test_negative_priority_gets_no_bare_messages() {
        let router = router().await;
        let _s = online(&router, "s1", "noelia@jackal.im/a", -1);
        assert!(matches!(
            router
                .route(&message("ortuman@jackal.im/balcony", "noelia@jackal.im"))
                .await,
            Err(RouteError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_full_jid_routing() {
        let router = router().await;
        let mut a = online(&router, "s1", "noelia@jackal.im/a", 1);
        let mut b = online(&router, "s2", "noelia@jackal.im/b", 5);
        router
            .route(&message("ortuman@jackal.im/balcony", "noelia@jackal.im/a"))
            .await
            .unwrap();
        assert!(a.try_next().is_some());
        assert!(b.try_next().is_none());
        assert!(matches!(
            router
                .route(&message("ortuman@jackal.im/balcony", "noelia@jackal.im/zz"))
                .await,
            Err(RouteError::ResourceNotFound)
        ));
    }

    #[tokio::test]
    async fn test_presence_broadcast() {
        let router = router().await;
        let mut a = online(&router, "s1", "noelia@jackal.im/a", 1);
        let mut b = online(&router, "s2", "noelia@jackal.im/b", -3);
        let from: Jid = "ortuman@jackal.im/balcony".parse().unwrap();
        let to: Jid = "noelia@jackal.im".parse().unwrap();
        let presence = Stanza::Presence(Presence::with_type(&from, &to, ""));
        router.route(&presence).await.unwrap();
        assert!(a.try_next().is_some());
        assert!(b.try_next().is_some());
    }

    #[tokio::test]
    async fn test_unknown_and_offline_accounts() {
        let router = router().await;
        assert!(matches!(
            router
                .route(&message("ortuman@jackal.im/balcony", "nobody@jackal.im"))
                .await,
            Err(RouteError::NotExistingAccount)
        ));
        assert!(matches!(
            router
                .route(&message("ortuman@jackal.im/balcony", "hamlet@jackal.im"))
                .await,
            Err(RouteError::NotAuthenticated)
        ));
        assert!(matches!(
            router
                .route(&message("ortuman@jackal.im/balcony", "hamlet@example.org"))
                .await,
            Err(RouteError::NotLocalDomain(_))
        ));
    }

    #[tokio::test]
    async fn test_block_list_patterns() {
        let router = router().await;
        let repo = router.repository().clone();
        repo.upsert_block_list_item(&BlockListItem {
            username: "ortuman".to_string(),
            jid: "jackal.im/balcony".to_string(),
        })
        .await
        .unwrap();

        let cases = [
            ("hamlet@jackal.im/balcony", true),
            ("noelia@jackal.im/balcony", true),
            ("hamlet@jackal.im/garden", false),
            ("hamlet@jackal.im", false),
        ];
        for (jid, expected) in cases {
            let jid: Jid = jid.parse().unwrap();
            assert_eq!(router.is_blocked_jid(&jid, "ortuman").await.unwrap(), expected);
        }

        repo.upsert_block_list_item(&BlockListItem {
            username: "ortuman".to_string(),
            jid: "example.org".to_string(),
        })
        .await
        .unwrap();
        let jid: Jid = "juliet@example.org/x".parse().unwrap();
        assert!(router.is_blocked_jid(&jid, "ortuman").await.unwrap());

        let _s = online(&router, "s1", "ortuman@jackal.im/balcony", 0);
        assert!(matches!(
            router
                .route(&message("hamlet@jackal.im/balcony", "ortuman@jackal.im/balcony"))
                .await,
            Err(RouteError::BlockedJid)
        ));
    }

    #[tokio::test]
    async fn test_streams_matching_jid() {
        let router = router().await;
        let _a = online(&router, "s1", "noelia@jackal.im/a", 1);
        let _b = online(&router, "s2", "noelia@jackal.im/b", 1);
        let _c = online(&router, "s3", "ortuman@jackal.im/a", 1);

        let bare: Jid = "noelia@jackal.im".parse().unwrap();
        assert_eq!(router.streams_matching_jid(&bare).len(), 2);
        let full: Jid = "noelia@jackal.im/a".parse().unwrap();
        assert_eq!(router.streams_matching_jid(&full).len(), 1);
        let domain: Jid = "jackal.im".parse().unwrap();
        assert_eq!(router.streams_matching_jid(&domain).len(), 3);
    }
}
