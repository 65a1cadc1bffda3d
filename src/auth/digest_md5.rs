//! DIGEST-MD5 (RFC 2831), `qop=auth` only.

use std::collections::HashMap;

use async_trait::async_trait;
use md5::{Digest, Md5};
use subtle::ConstantTimeEq;
use tracing::error;

use super::{
    challenge, decode_payload, random_nonce, success, AuthContext, Authenticator, Mechanism,
    SaslError, SaslStep,
};
use crate::storage::UserRepository;
use crate::xml::Element;

enum State {
    Start,
    Challenged { nonce: String },
    ResponseVerified { username: String },
    Done,
}

pub struct DigestMd5 {
    ctx: AuthContext,
    state: State,
    username: String,
}

impl DigestMd5 {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            state: State::Start,
            username: String::new(),
        }
    }

    fn first_challenge(&mut self) -> SaslStep {
        let nonce = random_nonce();
        let payload = format!(
            r#"realm="{}",nonce="{}",qop="auth",charset=utf-8,algorithm=md5-sess"#,
            self.ctx.domain, nonce
        );
        self.state = State::Challenged { nonce };
        SaslStep::Continue(challenge(payload.as_bytes()))
    }

    async fn verify_response(&mut self, elem: &Element, nonce: &str) -> Result<SaslStep, SaslError> {
        let payload = decode_payload(elem)?;
        let payload = std::str::from_utf8(&payload).map_err(|_| SaslError::IncorrectEncoding)?;
        let params = parse_params(payload)?;
        let param = |key: &str| params.get(key).map(String::as_str).unwrap_or("");

        let username = param("username");
        let cnonce = param("cnonce");
        let response = param("response");
        if username.is_empty() || cnonce.is_empty() || response.is_empty() {
            return Err(SaslError::MalformedRequest);
        }
        let domain = self.ctx.domain.as_str();
        let digest_uri = format!("xmpp/{domain}");
        if param("realm") != domain
            || param("nonce") != nonce
            || param("nc") != "00000001"
            || param("qop") != "auth"
            || param("digest-uri") != digest_uri
        {
            return Err(SaslError::NotAuthorized);
        }
        if !matches!(param("charset"), "" | "utf-8") {
            return Err(SaslError::MalformedRequest);
        }
        let authzid = param("authzid");
        if !authzid.is_empty() && authzid != format!("{username}@{domain}") {
            return Err(SaslError::NotAuthorized);
        }

        let user = match self.ctx.repo.fetch_user(username).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err(SaslError::NotAuthorized),
            Err(e) => {
                error!(error = %e, "failed to fetch user");
                return Err(SaslError::TemporaryAuthFailure);
            }
        };
        let input = DigestInput {
            username,
            realm: domain,
            password: &user.password,
            nonce,
            cnonce,
            nc: "00000001",
            qop: "auth",
            digest_uri: &digest_uri,
            authzid,
        };
        let expected = input.compute("AUTHENTICATE");
        if !bool::from(expected.as_bytes().ct_eq(response.as_bytes())) {
            return Err(SaslError::NotAuthorized);
        }

        let rspauth = format!("rspauth={}", input.compute(""));
        self.state = State::ResponseVerified {
            username: user.username,
        };
        Ok(SaslStep::Continue(challenge(rspauth.as_bytes())))
    }
}

#[async_trait]
impl Authenticator for DigestMd5 {
    fn mechanism(&self) -> Mechanism {
        Mechanism::DigestMd5
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn authenticated(&self) -> bool {
        matches!(self.state, State::Done)
    }

    async fn process(&mut self, elem: &Element) -> Result<SaslStep, SaslError> {
        match std::mem::replace(&mut self.state, State::Start) {
            State::Start => Ok(self.first_challenge()),
            State::Challenged { nonce } => {
                let result = self.verify_response(elem, &nonce).await;
                if result.is_err() {
                    self.state = State::Challenged { nonce };
                }
                result
            }
            State::ResponseVerified { username } => {
                if !decode_payload(elem)?.is_empty() {
                    return Err(SaslError::MalformedRequest);
                }
                self.username = username;
                self.state = State::Done;
                Ok(SaslStep::Done(success(None)))
            }
            State::Done => {
                self.state = State::Done;
                Err(SaslError::MalformedRequest)
            }
        }
    }

    fn reset(&mut self) {
        self.state = State::Start;
        self.username.clear();
    }
}

struct DigestInput<'a> {
    username: &'a str,
    realm: &'a str,
    password: &'a str,
    nonce: &'a str,
    cnonce: &'a str,
    nc: &'a str,
    qop: &'a str,
    digest_uri: &'a str,
    authzid: &'a str,
}

impl DigestInput<'_> {
    /// Response value; `a2_method` is `AUTHENTICATE` for the client response
    /// and empty for `rspauth`.
    fn compute(&self, a2_method: &str) -> String {
        let secret = Md5::digest(format!("{}:{}:{}", self.username, self.realm, self.password));
        let mut a1 = secret.to_vec();
        a1.extend_from_slice(format!(":{}:{}", self.nonce, self.cnonce).as_bytes());
        if !self.authzid.is_empty() {
            a1.extend_from_slice(format!(":{}", self.authzid).as_bytes());
        }
        let ha1 = hex::encode(Md5::digest(&a1));
        let ha2 = hex::encode(Md5::digest(format!("{}:{}", a2_method, self.digest_uri)));
        hex::encode(Md5::digest(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, self.nonce, self.nc, self.cnonce, self.qop, ha2
        )))
    }
}

/// Parses `key=value` pairs; values may be quoted and contain commas.
fn parse_params(s: &str) -> Result<HashMap<String, String>, SaslError> {
    let mut params = HashMap::new();
    let mut chars = s.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err(SaslError::MalformedRequest);
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        let key = key.trim();
        if key.is_empty() {
            return Err(SaslError::MalformedRequest);
        }
        params.insert(key.to_string(), value.trim().to_string());
    }
    Ok(params)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tests::{auth_elem, decode_text, response_elem, sasl_context};

    /// Digest response of `mariana` for `challenge_text`.
    pub(crate) fn client_response(challenge_text: &str, password: &str) -> String {
        let params = parse_params(challenge_text).unwrap();
        let input = DigestInput {
            username: "mariana",
            realm: "jackal.im",
            password,
            nonce: &params["nonce"],
            cnonce: "OA6MHXh6VqTrRk",
            nc: "00000001",
            qop: "auth",
            digest_uri: "xmpp/jackal.im",
            authzid: "",
        };
        format!(
            r#"username="mariana",realm="jackal.im",nonce="{}",cnonce="OA6MHXh6VqTrRk",nc=00000001,qop=auth,digest-uri="xmpp/jackal.im",response={},charset=utf-8"#,
            params["nonce"],
            input.compute("AUTHENTICATE")
        )
    }

    async fn first_challenge(digest: &mut DigestMd5) -> String {
        match digest.process(&auth_elem("DIGEST-MD5", b"")).await.unwrap() {
            SaslStep::Continue(elem) => decode_text(&elem),
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_parse_params() {
        let params =
            parse_params(r#"realm="jackal.im",nonce="a,b\"c",qop=auth , nc=00000001"#).unwrap();
        assert_eq!(params["realm"], "jackal.im");
        assert_eq!(params["nonce"], "a,b\"c");
        assert_eq!(params["qop"], "auth");
        assert_eq!(params["nc"], "00000001");
        assert!(parse_params(r#"realm="unterminated"#).is_err());
    }

    #[tokio::test]
    async fn test_first_challenge_params() {
        let mut digest = DigestMd5::new(sasl_context(false).await);
        let text = first_challenge(&mut digest).await;
        let params = parse_params(&text).unwrap();
        assert_eq!(params["realm"], "jackal.im");
        assert_eq!(params["qop"], "auth");
        assert_eq!(params["charset"], "utf-8");
        assert_eq!(params["algorithm"], "md5-sess");
        assert!(!params["nonce"].is_empty());
    }

    #[tokio::test]
    async fn test_digest_success() {
        let mut digest = DigestMd5::new(sasl_context(false).await);
        let text = first_challenge(&mut digest).await;
        let response = client_response(&text, "1234");

        let rspauth = match digest.process(&response_elem(response.as_bytes())).await.unwrap() {
            SaslStep::Continue(elem) => decode_text(&elem),
            other => panic!("unexpected step {:?}", other),
        };
        assert!(rspauth.starts_with("rspauth="));
        assert!(!digest.authenticated());

        let empty = Element::with_ns("response", crate::xml::ns::SASL);
        match digest.process(&empty).await.unwrap() {
            SaslStep::Done(elem) => assert_eq!(elem.name(), "success"),
            other => panic!("unexpected step {:?}", other),
        }
        assert!(digest.authenticated());
        assert_eq!(digest.username(), "mariana");
    }

    #[tokio::test]
    async fn test_digest_wrong_password() {
        let mut digest = DigestMd5::new(sasl_context(false).await);
        let text = first_challenge(&mut digest).await;
        let response = client_response(&text, "bad");
        let err = digest
            .process(&response_elem(response.as_bytes()))
            .await
            .unwrap_err();
        assert_eq!(err, SaslError::NotAuthorized);
        assert_eq!(
            err.element().to_xml(),
            r#"<failure xmlns="urn:ietf:params:xml:ns:xmpp-sasl"><not-authorized/></failure>"#
        );
        digest.reset();
        assert!(!digest.authenticated());
        assert!(digest.username().is_empty());
    }

    #[tokio::test]
    async fn test_digest_rejects_wrong_digest_uri() {
        let mut digest = DigestMd5::new(sasl_context(false).await);
        let text = first_challenge(&mut digest).await;
        let response = client_response(&text, "1234").replace("xmpp/jackal.im", "xmpp/other.im");
        let err = digest
            .process(&response_elem(response.as_bytes()))
            .await
            .unwrap_err();
        assert_eq!(err, SaslError::NotAuthorized);
    }
}
