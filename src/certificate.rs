//! Certificate store for TLS termination
//! Holds one identity per domain and picks one per handshake from the
//! client's server name, falling back to the first identity loaded.

use crate::error::{DuplicateDomain, StartupError};
use crate::target::TargetDefinition;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Crypto provider used for every TLS config in the process.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Pair a certificate chain with its private key, checking they match.
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> Result<CertifiedKey, rustls::Error> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(key)?;
    let certified = CertifiedKey::new(chain, signing_key);
    certified.keys_match()?;
    Ok(certified)
}

/// A loaded TLS identity
#[derive(Debug)]
struct Identity {
    domain: String,
    key: Arc<CertifiedKey>,
}

/// All TLS identities of the process, in load order.
#[derive(Debug)]
pub struct CertificateStore {
    identities: Vec<Identity>,
    by_name: HashMap<String, usize>,
}

impl CertificateStore {
    /// Load every definition's certificate/key pair.
    ///
    /// Aborts on the first pair that does not parse or match; a store never
    /// serves a partial set of identities.
    pub fn load(definitions: &[TargetDefinition]) -> Result<Self, StartupError> {
        if definitions.is_empty() {
            return Err(StartupError::NoTargets);
        }

        let mut identities: Vec<Identity> = Vec::with_capacity(definitions.len());
        let mut by_name: HashMap<String, usize> = HashMap::with_capacity(definitions.len());

        for (index, def) in definitions.iter().enumerate() {
            // rustls hands the resolver a lowercased server name.
            let name = def.domain().to_ascii_lowercase();

            // An existing entry may only be a port alias of another domain.
            if let Some(&first) = by_name.get(&name) {
                if identities[first].domain.eq_ignore_ascii_case(def.domain()) {
                    return Err(DuplicateDomain {
                        domain: def.domain().to_string(),
                        first,
                        second: index,
                    }
                    .into());
                }
            }

            let key = certified_key(def.certificate().to_vec(), def.private_key()).map_err(
                |source| StartupError::Identity {
                    index,
                    domain: def.domain().to_string(),
                    source,
                },
            )?;

            // SNI never carries a port, so "example.com:8443" is also reachable as "example.com".
            if let Some((host, _port)) = name.rsplit_once(':') {
                by_name.entry(host.to_string()).or_insert(index);
            }
            by_name.insert(name, index);

            debug!("Loaded TLS identity for: {}", def.domain());
            identities.push(Identity {
                domain: def.domain().to_string(),
                key: Arc::new(key),
            });
        }

        info!(
            "Certificate store loaded {} identities (default: {})",
            identities.len(),
            identities[0].domain
        );

        Ok(Self {
            identities,
            by_name,
        })
    }

    /// Pick the identity for a handshake.
    ///
    /// Exact match of the server name as rustls presents it (lowercase)
    /// against the lowercased domains; no name or an unknown one gets the
    /// first-loaded identity.
    pub fn select(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        let matched = server_name.and_then(|name| self.by_name.get(name));

        match matched {
            Some(&index) => self.identities[index].key.clone(),
            None => {
                debug!(
                    "No identity for server name {:?}, using default {}",
                    server_name,
                    self.default_domain()
                );
                self.identities[0].key.clone()
            }
        }
    }

    /// Domain of the fallback identity.
    pub fn default_domain(&self) -> &str {
        &self.identities[0].domain
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.select(client_hello.server_name()))
    }
}
