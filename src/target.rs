//! Target definitions
//! A validated virtual host: domain, backend URL and TLS identity material.

use crate::certificate;
use crate::config::TargetSpec;
use crate::error::{StartupError, TargetError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;
use url::Url;

/// One virtual host's routing facts. Immutable once loaded.
pub struct TargetDefinition {
    domain: String,
    backend: Url,
    certificate: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl TargetDefinition {
    /// Validate a raw target set.
    ///
    /// Checks run in a fixed order and the first failure wins: host, target
    /// url, certificate, private key (including whether it matches the
    /// certificate). The backend is not contacted.
    pub fn load(spec: &TargetSpec) -> Result<Self, TargetError> {
        if spec.host.is_empty() {
            return Err(TargetError::EmptyHost);
        }

        if spec.target_url.is_empty() {
            return Err(TargetError::EmptyTargetUrl);
        }
        let backend = parse_backend_url(&spec.target_url)?;

        let certificate = read_certificate(&spec.cert_file)?;
        let private_key = read_private_key(&spec.key_file)?;

        certificate::certified_key(certificate.clone(), &private_key).map_err(|e| {
            TargetError::KeyMismatch {
                path: spec.key_file.clone(),
                reason: e.to_string(),
            }
        })?;

        debug!("Validated target {} -> {}", spec.host, backend);

        Ok(Self {
            domain: spec.host.clone(),
            backend,
            certificate,
            private_key,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn backend(&self) -> &Url {
        &self.backend
    }

    pub fn certificate(&self) -> &[CertificateDer<'static>] {
        &self.certificate
    }

    pub fn private_key(&self) -> &PrivateKeyDer<'static> {
        &self.private_key
    }
}

impl fmt::Debug for TargetDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDefinition")
            .field("domain", &self.domain)
            .field("backend", &self.backend.as_str())
            .field("certificates", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

/// Validate every target set, naming the first failure by its index.
pub fn load_targets(specs: &[TargetSpec]) -> Result<Vec<TargetDefinition>, StartupError> {
    if specs.is_empty() {
        return Err(StartupError::NoTargets);
    }

    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            TargetDefinition::load(spec).map_err(|source| StartupError::Target {
                index,
                host: spec.host.clone(),
                source,
            })
        })
        .collect()
}

fn parse_backend_url(raw: &str) -> Result<Url, TargetError> {
    let invalid = |reason: String| TargetError::InvalidTargetUrl {
        url: raw.to_string(),
        reason,
    };

    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(invalid(format!("unsupported scheme {:?}", other))),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    Ok(url)
}

fn read_certificate(path: &Path) -> Result<Vec<CertificateDer<'static>>, TargetError> {
    let pem = fs::read(path).map_err(|source| TargetError::CertificateUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let invalid = |reason: String| TargetError::CertificateInvalid {
        path: path.to_path_buf(),
        reason,
    };

    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;

    if certs.is_empty() {
        return Err(invalid("no certificates found in file".to_string()));
    }

    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TargetError> {
    let pem = fs::read(path).map_err(|source| TargetError::KeyUnreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let invalid = |reason: String| TargetError::KeyInvalid {
        path: path.to_path_buf(),
        reason,
    };

    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| invalid(e.to_string()))?
        .ok_or_else(|| invalid("no private key found in file".to_string()))
}
