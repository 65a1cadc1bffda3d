//! Locally served domains and their TLS settings.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tracing::info;

use crate::config::HostConfig;
use crate::error::ConfigError;

/// Installs the ring provider as process default. Safe to call repeatedly.
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Immutable set of local domains. The first configured host is the default.
#[derive(Clone)]
pub struct Hosts {
    default_host: String,
    hosts: HashMap<String, Option<Arc<ServerConfig>>>,
}

impl std::fmt::Debug for Hosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hosts")
            .field("default_host", &self.default_host)
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Hosts {
    pub fn new(configs: &[HostConfig]) -> Result<Self, ConfigError> {
        let Some(first) = configs.first() else {
            return Err(ConfigError::Invalid("no hosts configured".to_string()));
        };
        init_crypto_provider();
        let mut hosts = HashMap::new();
        for host in configs {
            let tls = match &host.tls {
                Some(tls) => Some(load_tls_config(&host.name, &tls.cert_path, &tls.privkey_path)?),
                None => None,
            };
            info!(host = %host.name, tls = tls.is_some(), "registered local host");
            hosts.insert(host.name.to_lowercase(), tls);
        }
        Ok(Self {
            default_host: first.name.to_lowercase(),
            hosts,
        })
    }

    /// Hosts without TLS.
    pub fn from_names(names: &[&str]) -> Self {
        Self {
            default_host: names.first().map(|n| n.to_lowercase()).unwrap_or_default(),
            hosts: names.iter().map(|n| (n.to_lowercase(), None)).collect(),
        }
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    pub fn is_local_host(&self, domain: &str) -> bool {
        self.hosts.contains_key(domain)
    }

    pub fn tls_config(&self, domain: &str) -> Option<Arc<ServerConfig>> {
        self.hosts.get(domain).cloned().flatten()
    }

    /// Certificate used for `wss` listeners, where the domain is not known
    /// before the handshake.
    pub fn default_tls_config(&self) -> Option<Arc<ServerConfig>> {
        self.tls_config(&self.default_host)
            .or_else(|| self.hosts.values().flatten().next().cloned())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hosts.keys().map(String::as_str)
    }
}

fn load_tls_config(
    host: &str,
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, ConfigError> {
    let tls_err = |reason: String| ConfigError::Tls {
        host: host.to_string(),
        reason,
    };
    let cert_file = File::open(cert_path)
        .map_err(|e| tls_err(format!("{}: {}", cert_path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(format!("invalid certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(tls_err(format!("no certificate in {}", cert_path.display())));
    }
    let key_file =
        File::open(key_path).map_err(|e| tls_err(format!("{}: {}", key_path.display(), e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| tls_err(format!("invalid private key: {}", e)))?
        .ok_or_else(|| tls_err(format!("no private key in {}", key_path.display())))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_err(e.to_string()))?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;

    #[test]
    fn test_local_hosts() {
        let hosts = Hosts::from_names(&["jackal.im", "Example.org"]);
        assert_eq!(hosts.default_host(), "jackal.im");
        assert!(hosts.is_local_host("jackal.im"));
        assert!(hosts.is_local_host("example.org"));
        assert!(!hosts.is_local_host("xmpp.org"));
        assert!(hosts.tls_config("jackal.im").is_none());
        assert!(hosts.default_tls_config().is_none());
    }

    #[test]
    fn test_missing_certificate() {
        let configs = vec![HostConfig {
            name: "jackal.im".to_string(),
            tls: Some(TlsConfig {
                cert_path: "/nonexistent/cert.pem".into(),
                privkey_path: "/nonexistent/key.pem".into(),
            }),
        }];
        assert!(matches!(Hosts::new(&configs), Err(ConfigError::Tls { .. })));
    }

    #[test]
    fn test_empty_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        let configs = vec![HostConfig {
            name: "jackal.im".to_string(),
            tls: Some(TlsConfig {
                cert_path: cert,
                privkey_path: key,
            }),
        }];
        assert!(matches!(Hosts::new(&configs), Err(ConfigError::Tls { .. })));
    }

    #[test]
    fn test_no_hosts() {
        assert!(matches!(Hosts::new(&[]), Err(ConfigError::Invalid(_))));
    }
}
