//! SCRAM-SHA-1 / SCRAM-SHA-256 and their channel-binding variants
//! (RFC 5802, RFC 7677).

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::error;

use super::{
    challenge, decode_payload, random_nonce, success, AuthContext, Authenticator, Mechanism,
    SaslError, SaslStep,
};
use crate::storage::{User, UserRepository};
use crate::xml::Element;

pub const ITERATION_COUNT: u32 = 4096;
const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha1,
    Sha256,
}

impl ScramHash {
    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha1 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            ScramHash::Sha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha1 => Sha1::digest(data).to_vec(),
            ScramHash::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    /// `Hi()`: PBKDF2 with HMAC as the pseudo-random function.
    fn hi(&self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramHash::Sha1 => {
                let mut out = [0u8; 20];
                pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut out);
                out.to_vec()
            }
            ScramHash::Sha256 => {
                let mut out = [0u8; 32];
                pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
                out.to_vec()
            }
        }
    }
}

/// Per-user SCRAM verifier data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScramCredentials {
    pub salt: Vec<u8>,
    pub iteration_count: u32,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

/// Derives credentials for `password` with a fresh random salt.
pub fn derive_credentials(hash: ScramHash, password: &str) -> ScramCredentials {
    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    derive_credentials_with_salt(hash, password, salt, ITERATION_COUNT)
}

pub fn derive_credentials_with_salt(
    hash: ScramHash,
    password: &str,
    salt: Vec<u8>,
    iteration_count: u32,
) -> ScramCredentials {
    let salted = hash.hi(password.as_bytes(), &salt, iteration_count);
    let client_key = hash.hmac(&salted, b"Client Key");
    ScramCredentials {
        stored_key: hash.digest(&client_key),
        server_key: hash.hmac(&salted, b"Server Key"),
        salt,
        iteration_count,
    }
}

enum State {
    Start,
    ServerFirstSent(Exchange),
    Done,
}

struct Exchange {
    gs2_header: String,
    client_first_bare: String,
    server_first: String,
    nonce: String,
    user: User,
}

pub struct Scram {
    ctx: AuthContext,
    hash: ScramHash,
    plus: bool,
    state: State,
    username: String,
}

impl Scram {
    pub fn new(ctx: AuthContext, hash: ScramHash, plus: bool) -> Self {
        Self {
            ctx,
            hash,
            plus,
            state: State::Start,
            username: String::new(),
        }
    }

    fn check_channel_binding_flag(&self, flag: &str) -> Result<(), SaslError> {
        match flag {
            "n" if !self.plus => Ok(()),
            // The client supports binding but believes we do not. If this
            // stream could have offered it, the negotiation was tampered with.
            "y" if !self.plus => {
                if self.ctx.secured {
                    Err(SaslError::NotAuthorized)
                } else {
                    Ok(())
                }
            }
            "p=tls-unique" if self.plus => {
                if self.ctx.channel_binding.is_some() {
                    Ok(())
                } else {
                    Err(SaslError::NotAuthorized)
                }
            }
            f if f.starts_with("p=") && self.plus => Err(SaslError::MalformedRequest),
            "n" | "y" => Err(SaslError::NotAuthorized),
            f if f.starts_with("p=") => Err(SaslError::NotAuthorized),
            _ => Err(SaslError::MalformedRequest),
        }
    }

    async fn client_first(&mut self, elem: &Element) -> Result<SaslStep, SaslError> {
        let payload = decode_payload(elem)?;
        let payload = String::from_utf8(payload).map_err(|_| SaslError::IncorrectEncoding)?;

        let mut parts = payload.splitn(3, ',');
        let (Some(flag), Some(authzid), Some(bare)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(SaslError::MalformedRequest);
        };
        self.check_channel_binding_flag(flag)?;
        if !authzid.is_empty() && !authzid.starts_with("a=") {
            return Err(SaslError::MalformedRequest);
        }

        let attrs = parse_attributes(bare)?;
        let (Some(username), Some(client_nonce)) = (attr(&attrs, 'n'), attr(&attrs, 'r')) else {
            return Err(SaslError::MalformedRequest);
        };
        if attr(&attrs, 'm').is_some() || client_nonce.is_empty() {
            return Err(SaslError::MalformedRequest);
        }
        let username = decode_username(username)?;
        if !authzid.is_empty() && authzid[2..] != format!("{}@{}", username, self.ctx.domain) {
            return Err(SaslError::NotAuthorized);
        }

        let user = match self.ctx.repo.fetch_user(&username).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err(SaslError::NotAuthorized),
            Err(e) => {
                error!(error = %e, "failed to fetch user");
                return Err(SaslError::TemporaryAuthFailure);
            }
        };
        let creds = user.scram(self.hash);
        let nonce = format!("{}{}", client_nonce, random_nonce());
        let server_first = format!(
            "r={},s={},i={}",
            nonce,
            BASE64.encode(&creds.salt),
            creds.iteration_count
        );
        let step = SaslStep::Continue(challenge(server_first.as_bytes()));

        self.state = State::ServerFirstSent(Exchange {
            gs2_header: format!("{flag},{authzid},"),
            client_first_bare: bare.to_string(),
            server_first,
            nonce,
            user,
        });
        Ok(step)
    }

    fn client_final(&mut self, elem: &Element, exchange: &Exchange) -> Result<SaslStep, SaslError> {
        let payload = decode_payload(elem)?;
        let payload = String::from_utf8(payload).map_err(|_| SaslError::IncorrectEncoding)?;

        let Some((without_proof, proof)) = payload.rsplit_once(",p=") else {
            return Err(SaslError::MalformedRequest);
        };
        let attrs = parse_attributes(without_proof)?;
        let (Some(cb), Some(nonce)) = (attr(&attrs, 'c'), attr(&attrs, 'r')) else {
            return Err(SaslError::MalformedRequest);
        };

        let mut expected_cb = exchange.gs2_header.as_bytes().to_vec();
        if self.plus {
            if let Some(binding) = &self.ctx.channel_binding {
                expected_cb.extend_from_slice(binding);
            }
        }
        let cb = BASE64.decode(cb).map_err(|_| SaslError::IncorrectEncoding)?;
        if cb != expected_cb || nonce != exchange.nonce {
            return Err(SaslError::NotAuthorized);
        }
        let proof = BASE64.decode(proof).map_err(|_| SaslError::IncorrectEncoding)?;

        let creds = exchange.user.scram(self.hash);
        let auth_message = format!(
            "{},{},{}",
            exchange.client_first_bare, exchange.server_first, without_proof
        );
        let client_signature = self.hash.hmac(&creds.stored_key, auth_message.as_bytes());
        if proof.len() != client_signature.len() {
            return Err(SaslError::NotAuthorized);
        }
        let client_key: Vec<u8> = proof
            .iter()
            .zip(&client_signature)
            .map(|(p, s)| p ^ s)
            .collect();
        if !bool::from(self.hash.digest(&client_key).ct_eq(&creds.stored_key)) {
            return Err(SaslError::NotAuthorized);
        }

        let server_signature = self.hash.hmac(&creds.server_key, auth_message.as_bytes());
        let verifier = format!("v={}", BASE64.encode(server_signature));
        Ok(SaslStep::Done(success(Some(verifier.as_bytes()))))
    }
}

#[async_trait]
impl Authenticator for Scram {
    fn mechanism(&self) -> Mechanism {
        match (self.hash, self.plus) {
            (ScramHash::Sha1, false) => Mechanism::ScramSha1,
            (ScramHash::Sha256, false) => Mechanism::ScramSha256,
            (ScramHash::Sha1, true) => Mechanism::ScramSha1Plus,
            (ScramHash::Sha256, true) => Mechanism::ScramSha256Plus,
        }
    }

    fn username(&self) -> &str {
        &self.username
    }

    fn authenticated(&self) -> bool {
        matches!(self.state, State::Done)
    }

    async fn process(&mut self, elem: &Element) -> Result<SaslStep, SaslError> {
        match std::mem::replace(&mut self.state, State::Start) {
            State::Start => self.client_first(elem).await,
            State::ServerFirstSent(exchange) => {
                let result = self.client_final(elem, &exchange);
                if result.is_ok() {
                    self.username = exchange.user.username;
                    self.state = State::Done;
                }
                result
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

fn parse_attributes(s: &str) -> Result<Vec<(char, &str)>, SaslError> {
    s.split(',')
        .map(|part| {
            let mut chars = part.chars();
            match (chars.next(), chars.next()) {
                (Some(key), Some('=')) => Ok((key, &part[2..])),
                _ => Err(SaslError::MalformedRequest),
            }
        })
        .collect()
}

fn attr<'a>(attrs: &[(char, &'a str)], key: char) -> Option<&'a str> {
    attrs.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Undoes the `=2C` / `=3D` escaping of `saslname`.
fn decode_username(s: &str) -> Result<String, SaslError> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('=') {
        out.push_str(&rest[..pos]);
        match rest.get(pos..pos + 3) {
            Some("=2C") => out.push(','),
            Some("=3D") => out.push('='),
            _ => return Err(SaslError::MalformedRequest),
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    if out.is_empty() {
        return Err(SaslError::MalformedRequest);
    }
    Ok(out)
}
