//! Error types for vhostproxy
//!
//! Everything here is a startup-time error. Per-request failures never
//! surface as these types: they become HTTP responses for that one client.

use std::io;
use std::path::PathBuf;

/// Validation failure for a single target set.
///
/// Variants are ordered the way validation checks them: host, target url,
/// certificate, private key.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("host is empty")]
    EmptyHost,

    #[error("target url is empty")]
    EmptyTargetUrl,

    #[error("target url {url:?} invalid: {reason}")]
    InvalidTargetUrl { url: String, reason: String },

    #[error("certfile {} unreadable: {source}", .path.display())]
    CertificateUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("certfile {} invalid: {reason}", .path.display())]
    CertificateInvalid { path: PathBuf, reason: String },

    #[error("keyfile {} unreadable: {source}", .path.display())]
    KeyUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("keyfile {} invalid: {reason}", .path.display())]
    KeyInvalid { path: PathBuf, reason: String },

    #[error("keyfile {} does not match its certificate: {reason}", .path.display())]
    KeyMismatch { path: PathBuf, reason: String },
}

impl TargetError {
    /// Name of the target-set field that failed, as spelled on the command line.
    pub fn field(&self) -> &'static str {
        match self {
            TargetError::EmptyHost => "host",
            TargetError::EmptyTargetUrl | TargetError::InvalidTargetUrl { .. } => "targeturl",
            TargetError::CertificateUnreadable { .. } | TargetError::CertificateInvalid { .. } => {
                "certfile"
            }
            TargetError::KeyUnreadable { .. }
            | TargetError::KeyInvalid { .. }
            | TargetError::KeyMismatch { .. } => "keyfile",
        }
    }
}

/// Two target sets claim the same domain.
#[derive(Debug, thiserror::Error)]
#[error("duplicate domain {domain:?} in target sets {first} and {second}")]
pub struct DuplicateDomain {
    pub domain: String,
    pub first: usize,
    pub second: usize,
}

/// Anything that stops the proxy from leaving the initializing state.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("no target sets configured")]
    NoTargets,

    #[error("target set {index} ({host:?}) --{}: {source}", .source.field())]
    Target {
        index: usize,
        host: String,
        #[source]
        source: TargetError,
    },

    #[error("target set {index} ({domain:?}): TLS identity rejected: {source}")]
    Identity {
        index: usize,
        domain: String,
        #[source]
        source: rustls::Error,
    },

    #[error(transparent)]
    Duplicate(#[from] DuplicateDomain),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Failure turning raw command-line or file input into target specs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("target set {index} is missing --{flag}=<?>")]
    MissingFlag { index: usize, flag: &'static str },

    #[error("failed to read targets file {}: {source}", .path.display())]
    TargetsFileUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse targets file {}: {source}", .path.display())]
    TargetsFileInvalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
