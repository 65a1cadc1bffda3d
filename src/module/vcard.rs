//! XEP-0054: vcard-temp. Payloads are stored and returned verbatim.

use async_trait::async_trait;

use super::Module;
use crate::error::ModuleError;
use crate::router::{Router, StreamHandle};
use crate::storage::VCardRepository;
use crate::xml::{ns, Element, Iq, StanzaErrorCondition};

pub struct VCard {
    router: Router,
}

impl VCard {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Module for VCard {
    fn name(&self) -> &'static str {
        "vcard"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::VCARD]
    }

    fn account_features(&self) -> Vec<&'static str> {
        vec![ns::VCARD]
    }

    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::VCARD
    }

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        let vcard = iq
            .payload()
            .filter(|p| p.name() == "vCard")
            .ok_or(ModuleError::Stanza(StanzaErrorCondition::BadRequest))?;
        let repo = self.router.repository();

        if iq.is_get() {
            if !vcard.elements().is_empty() {
                return Err(ModuleError::Stanza(StanzaErrorCondition::BadRequest));
            }
            let username = if iq.to().is_server() {
                stream.username()
            } else {
                iq.to().node().to_string()
            };
            let stored = repo
                .fetch_vcard(&username)
                .await?
                .unwrap_or_else(|| Element::with_ns("vCard", ns::VCARD));
            stream.reply(iq.result_with(stored));
            return Ok(());
        }

        let username = stream.username();
        if iq.to().node() != username {
            return Err(ModuleError::Stanza(StanzaErrorCondition::Forbidden));
        }
        repo.upsert_vcard(vcard, &username).await?;
        stream.reply(iq.result_iq());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::tests::{iq_from, online_stream, test_router};

    #[tokio::test]
    async fn test_set_then_get() {
        let router = test_router(&["ortuman", "noelia"]).await;
        let mut s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let module = VCard::new(router.clone());

        let set = iq_from(
            &s.handle,
            r#"<iq id="v1" type="set"><vCard xmlns="vcard-temp"><FN>Miguel Ángel</FN></vCard></iq>"#,
        );
        module.process_iq(&s.handle, &set).await.unwrap();
        assert_eq!(s.try_next().unwrap().type_attr(), "result");

        let mut n = online_stream(&router, "s2", "noelia@jackal.im/garden");
        let get = iq_from(
            &n.handle,
            r#"<iq id="v2" type="get" to="ortuman@jackal.im"><vCard xmlns="vcard-temp"/></iq>"#,
        );
        module.process_iq(&n.handle, &get).await.unwrap();
        let reply = n.try_next().unwrap();
        let vcard = reply.find_ns("vCard", ns::VCARD).unwrap();
        assert_eq!(vcard.find("FN").unwrap().get_text(), "Miguel Ángel");
    }

    #[tokio::test]
    async fn test_empty_vcard_when_missing() {
        let router = test_router(&["ortuman"]).await;
        let mut s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let get = iq_from(&s.handle, r#"<iq id="v2" type="get"><vCard xmlns="vcard-temp"/></iq>"#);
        VCard::new(router).process_iq(&s.handle, &get).await.unwrap();
        let reply = s.try_next().unwrap();
        assert!(reply.find_ns("vCard", ns::VCARD).unwrap().elements().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_set_is_forbidden() {
        let router = test_router(&["ortuman", "noelia"]).await;
        let s = online_stream(&router, "s1", "ortuman@jackal.im/balcony");
        let set = iq_from(
            &s.handle,
            r#"<iq id="v1" type="set" to="noelia@jackal.im"><vCard xmlns="vcard-temp"><FN>x</FN></vCard></iq>"#,
        );
        assert!(matches!(
            VCard::new(router).process_iq(&s.handle, &set).await,
            Err(ModuleError::Stanza(StanzaErrorCondition::Forbidden))
        ));
    }
}
