//! PLAIN (RFC 4616).

use async_trait::async_trait;
use subtle::ConstantTimeEq;
use tracing::error;

use super::{decode_payload, success, AuthContext, Authenticator, Mechanism, SaslError, SaslStep};
use crate::jid::Jid;
use crate::storage::UserRepository;
use crate::xml::Element;

pub struct Plain {
    ctx: AuthContext,
    username: String,
    authenticated: bool,
}

impl Plain {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            username: String::new(),
            authenticated: false,
        }
    }
}

#[async_trait]
impl Authenticator for Plain {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Plain
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn authenticated(&self) -> bool {
        self.authenticated
    }

    async fn process(&mut self, elem: &Element) -> Result<SaslStep, SaslError> {
        if self.authenticated {
            return Err(SaslError::MalformedRequest);
        }
        let payload = decode_payload(elem)?;
        let parts: Vec<&[u8]> = payload.split(|b| *b == 0).collect();
        let [authzid, authcid, password] = parts.as_slice() else {
            return Err(SaslError::IncorrectEncoding);
        };
        let authzid = std::str::from_utf8(authzid).map_err(|_| SaslError::IncorrectEncoding)?;
        let username = std::str::from_utf8(authcid).map_err(|_| SaslError::IncorrectEncoding)?;
        if username.is_empty() {
            return Err(SaslError::MalformedRequest);
        }
        let jid = Jid::new(username, &self.ctx.domain, "").map_err(|_| SaslError::MalformedRequest)?;
        if !authzid.is_empty() && authzid != jid.bare_string() {
            return Err(SaslError::NotAuthorized);
        }

        let user = match self.ctx.repo.fetch_user(jid.node()).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err(SaslError::NotAuthorized),
            Err(e) => {
                error!(error = %e, "failed to fetch user");
                return Err(SaslError::TemporaryAuthFailure);
            }
        };
        if !bool::from(user.password.as_bytes().ct_eq(password)) {
            return Err(SaslError::NotAuthorized);
        }

        self.username = user.username;
        self.authenticated = true;
        Ok(SaslStep::Done(success(None)))
    }

    fn reset(&mut self) {
        self.username.clear();
        self.authenticated = false;
    }
}
