//! XMPP addresses (RFC 7622): `node@domain/resource`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Maximum byte length of each JID part.
const MAX_PART_LEN: usize = 1023;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("empty domain")]
    EmptyDomain,
    #[error("{0} part exceeds {MAX_PART_LEN} bytes")]
    TooLong(&'static str),
    #[error("invalid character {1:?} in {0} part")]
    InvalidChar(&'static str, char),
    #[error("empty {0} part")]
    EmptyPart(&'static str),
}

/// Which components take part in a JID comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matching {
    pub node: bool,
    pub domain: bool,
    pub resource: bool,
}

impl Matching {
    pub const BARE: Matching = Matching { node: true, domain: true, resource: false };
    pub const FULL: Matching = Matching { node: true, domain: true, resource: true };
    pub const DOMAIN: Matching = Matching { node: false, domain: true, resource: false };
    pub const DOMAIN_RESOURCE: Matching = Matching { node: false, domain: true, resource: true };
}

/// An immutable XMPP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    node: String,
    domain: String,
    resource: String,
}

impl Jid {
    /// Builds a JID from its parts, applying case folding to node and domain.
    pub fn new(node: &str, domain: &str, resource: &str) -> Result<Self, JidError> {
        let node = node.to_lowercase();
        let domain = domain.trim_end_matches('.').to_lowercase();
        if domain.is_empty() {
            return Err(JidError::EmptyDomain);
        }
        check_part("node", &node)?;
        check_part("domain", &domain)?;
        check_part("resource", resource)?;
        if let Some(c) = node.chars().find(|c| is_forbidden_node_char(*c)) {
            return Err(JidError::InvalidChar("node", c));
        }
        if let Some(c) = domain.chars().find(|c| c.is_whitespace() || matches!(c, '@' | '/')) {
            return Err(JidError::InvalidChar("domain", c));
        }
        Ok(Self {
            node,
            domain,
            resource: resource.to_string(),
        })
    }

    /// Server JID (domain only).
    pub fn server(domain: &str) -> Result<Self, JidError> {
        Self::new("", domain, "")
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn is_server(&self) -> bool {
        self.node.is_empty() && self.resource.is_empty()
    }

    pub fn is_bare(&self) -> bool {
        !self.node.is_empty() && self.resource.is_empty()
    }

    pub fn is_full(&self) -> bool {
        !self.resource.is_empty()
    }

    pub fn is_full_with_user(&self) -> bool {
        !self.node.is_empty() && !self.resource.is_empty()
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: String::new(),
        }
    }

    pub fn to_server(&self) -> Jid {
        Jid {
            node: String::new(),
            domain: self.domain.clone(),
            resource: String::new(),
        }
    }

    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        check_part("resource", resource)?;
        Ok(Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: resource.to_string(),
        })
    }

    /// `node@domain` without resource.
    pub fn bare_string(&self) -> String {
        if self.node.is_empty() {
            self.domain.clone()
        } else {
            format!("{}@{}", self.node, self.domain)
        }
    }

    /// Compares the selected components of both JIDs.
    pub fn matches(&self, other: &Jid, opts: Matching) -> bool {
        (!opts.node || self.node == other.node)
            && (!opts.domain || self.domain == other.domain)
            && (!opts.resource || self.resource == other.resource)
    }
}

fn check_part(name: &'static str, part: &str) -> Result<(), JidError> {
    if part.len() > MAX_PART_LEN {
        return Err(JidError::TooLong(name));
    }
    Ok(())
}

fn is_forbidden_node_char(c: char) -> bool {
    c.is_whitespace() || matches!(c, '"' | '&' | '\'' | '/' | ':' | '<' | '>' | '@')
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, resource) = match s.split_once('/') {
            Some((rest, res)) => {
                if res.is_empty() {
                    return Err(JidError::EmptyPart("resource"));
                }
                (rest, res)
            }
            None => (s, ""),
        };
        let (node, domain) = match rest.split_once('@') {
            Some((node, domain)) => {
                if node.is_empty() {
                    return Err(JidError::EmptyPart("node"));
                }
                (node, domain)
            }
            None => ("", rest),
        };
        Jid::new(node, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.node.is_empty() {
            write!(f, "{}@", self.node)?;
        }
        f.write_str(&self.domain)?;
        if !self.resource.is_empty() {
            write!(f, "/{}", self.resource)?;
        }
        Ok(())
    }
}

impl Serialize for Jid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Jid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
