//! XEP-0092: Software Version.

use async_trait::async_trait;

use super::Module;
use crate::error::ModuleError;
use crate::router::StreamHandle;
use crate::xml::{ns, Element, Iq, StanzaErrorCondition};

pub struct Version {
    show_os: bool,
}

impl Version {
    pub fn new(show_os: bool) -> Self {
        Self { show_os }
    }
}

#[async_trait]
impl Module for Version {
    fn name(&self) -> &'static str {
        "version"
    }

    fn server_features(&self) -> Vec<&'static str> {
        vec![ns::VERSION]
    }

    fn matches_namespace(&self, namespace: &str, server_target: bool) -> bool {
        namespace == ns::VERSION && server_target
    }

    async fn process_iq(&self, stream: &StreamHandle, iq: &Iq) -> Result<(), ModuleError> {
        let query = iq.payload().filter(|q| q.name() == "query");
        if !iq.is_get() || query.map_or(true, |q| !q.elements().is_empty()) {
            return Err(ModuleError::Stanza(StanzaErrorCondition::BadRequest));
        }
        let mut result = Element::with_ns("query", ns::VERSION)
            .child(Element::new("name").text("jackal"))
            .child(Element::new("version").text(env!("CARGO_PKG_VERSION")));
        if self.show_os {
            result.append(
                Element::new("os")
                    .text(format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)),
            );
        }
        stream.reply(iq.result_with(result));
        Ok(())
    }
}
