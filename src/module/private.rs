//! XEP-0049: Private XML Storage.

use async_trait::async_trait;
use tracing::debug;

use super::Module;
use crate::error::ModuleError;
use crate::router::{Router, StreamHandle};
use crate::storage::PrivateRepository;
use crate::xml::{ns, Element, Iq, StanzaErrorCondition};

/// Namespaces that cannot be used as storage keys.
const RESERVED: &[&str] = &["jabber:client", "jabber:server", "jabber:iq:private"];

pub struct Private {
    router: Router,
}

impl Private {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

fn bad(condition: StanzaErrorCondition) -> ModuleError {
    ModuleError::Stanza(condition)
}

#[async_trait]
impl Module for Private {
    fn name(&self) -> &'static str {
        "private"
    }

    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::PRIVATE
    }

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        let username = stream.username();
        if iq.to().node() != username {
            return Err(bad(StanzaErrorCondition::Forbidden));
        }
        let query = iq
            .payload()
            .ok_or(bad(StanzaErrorCondition::BadRequest))?;
        let [child] = query.elements() else {
            return Err(bad(StanzaErrorCondition::NotAcceptable));
        };
        let namespace = child.namespace();
        if namespace.is_empty() || RESERVED.contains(&namespace) {
            return Err(bad(StanzaErrorCondition::NotAcceptable));
        }

        let repo = self.router.repository();
        if iq.is_get() {
            let stored = repo.fetch_private(namespace, &username).await?;
            let payload = stored.unwrap_or_else(|| child.clone());
            stream.reply(iq.result_with(Element::with_ns("query", ns::PRIVATE).child(payload)));
        } else {
            debug!(username = %username, namespace, "storing private xml");
            repo.upsert_private(child, namespace, &username).await?;
            stream.reply(iq.result_iq());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::tests::{iq_from, online_stream, test_router};

    #[tokio::test]
    async fn test_store_and_fetch() {
        let router = test_router(&["ortuman"]).await;
        let mut s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let module = Private::new(router);

        let set = iq_from(
            &s.handle,
            r#"<iq id="p1" type="set"><query xmlns="jabber:iq:private"><exodus xmlns="exodus:prefs"><defaultnick>Hamlet</defaultnick></exodus></query></iq>"#,
        );
        module.process_iq(&s.handle, &set).await.unwrap();
        assert_eq!(s.try_next().unwrap().type_attr(), "result");

        let get = iq_from(
            &s.handle,
            r#"<iq id="p2" type="get"><query xmlns="jabber:iq:private"><exodus xmlns="exodus:prefs"/></query></iq>"#,
        );
        module.process_iq(&s.handle, &get).await.unwrap();
        let reply = s.try_next().unwrap();
        let exodus = reply
            .find_ns("query", ns::PRIVATE)
            .unwrap()
            .find_ns("exodus", "exodus:prefs")
            .unwrap();
        assert_eq!(exodus.find("defaultnick").unwrap().get_text(), "Hamlet");
    }

    #[tokio::test]
    async fn test_missing_entry_echoes_request() {
        let router = test_router(&["ortuman"]).await;
        let mut s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let get = iq_from(
            &s.handle,
            r#"<iq id="p2" type="get"><query xmlns="jabber:iq:private"><storage xmlns="storage:bookmarks"/></query></iq>"#,
        );
        Private::new(router).process_iq(&s.handle, &get).await.unwrap();
        let reply = s.try_next().unwrap();
        let storage = reply.find_ns("query", ns::PRIVATE).unwrap().elements();
        assert_eq!(storage.len(), 1);
        assert!(storage[0].elements().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let router = test_router(&["ortuman", "noelia"]).await;
        let s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let module = Private::new(router);

        let other = iq_from(
            &s.handle,
            r#"<iq id="p1" type="get" to="noelia@jackal.im"><query xmlns="jabber:iq:private"><a xmlns="x:y"/></query></iq>"#,
        );
        assert!(matches!(
            module.process_iq(&s.handle, &other).await,
            Err(ModuleError::Stanza(StanzaErrorCondition::Forbidden))
        ));

        for xml in [
            r#"<iq id="p2" type="get"><query xmlns="jabber:iq:private"/></iq>"#,
            r#"<iq id="p3" type="get"><query xmlns="jabber:iq:private"><a/></query></iq>"#,
            r#"<iq id="p4" type="set"><query xmlns="jabber:iq:private"><a xmlns="jabber:client"/></query></iq>"#,
        ] {
            let iq = iq_from(&s.handle, xml);
            assert!(matches!(
                module.process_iq(&s.handle, &iq).await,
                Err(ModuleError::Stanza(StanzaErrorCondition::NotAcceptable))
            ));
        }
    }
}
