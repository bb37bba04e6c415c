//! vhostproxy - A TLS-terminating, name-based virtual-hosting reverse proxy
//!
//! One listening socket serves any number of domains:
//! - TLS 1.3 termination with a certificate chosen per handshake from SNI
//! - Routing of each decrypted request by its declared host
//! - Forwarding to a plain HTTP or HTTPS backend per domain
//! - 404 for undeclared hosts, 502 for unreachable backends

pub mod certificate;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod routing;
pub mod target;


pub use certificate::CertificateStore;
pub use config::{load_targets_file, TargetFlag, TargetFlags, TargetSpec};
pub use dispatch::Dispatcher;
pub use error::{ConfigError, DuplicateDomain, StartupError, TargetError};
pub use forward::{ReverseProxy, Upstream};
pub use proxy::{BoundProxy, ProxyConfig, ProxyServer};
pub use routing::{Resolve, RouteTable};
pub use target::{load_targets, TargetDefinition};
