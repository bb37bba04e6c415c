//! Route lookup
//!
//! # Responsibilities
//! - Build one forwarding handler per target definition
//! - Resolve a declared host to its handler
//!
//! # Design Decisions
//! - Immutable after construction (shared by `Arc`, read without locks)
//! - O(1) host lookup via HashMap, exact string match only
//! - Duplicate domains are rejected at build time

use crate::error::DuplicateDomain;
use crate::forward::{ReverseProxy, Upstream};
use crate::target::TargetDefinition;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::info;

/// Capability to resolve a declared host to its forwarding handler.
pub trait Resolve: Send + Sync {
    fn resolve(&self, host: &str) -> Option<&ReverseProxy>;
}

/// A routing entry plus the target set it came from
struct Route {
    index: usize,
    proxy: ReverseProxy,
}

/// Domain to handler table, built once at startup.
pub struct RouteTable {
    routes: HashMap<String, Route>,
}

impl RouteTable {
    /// Build the table, one handler per definition.
    pub fn build(
        definitions: &[TargetDefinition],
        upstream: &Upstream,
    ) -> Result<Self, DuplicateDomain> {
        let mut routes = HashMap::with_capacity(definitions.len());

        for (index, def) in definitions.iter().enumerate() {
            match routes.entry(def.domain().to_string()) {
                Entry::Occupied(existing) => {
                    let existing: &Route = existing.get();
                    return Err(DuplicateDomain {
                        domain: def.domain().to_string(),
                        first: existing.index,
                        second: index,
                    });
                }
                Entry::Vacant(slot) => {
                    info!("Route {} -> {}", def.domain(), def.backend());
                    slot.insert(Route {
                        index,
                        proxy: ReverseProxy::new(def.backend().clone(), upstream.clone()),
                    });
                }
            }
        }

        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routed domains in unspecified order.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl Resolve for RouteTable {
    fn resolve(&self, host: &str) -> Option<&ReverseProxy> {
        self.routes.get(host).map(|route| &route.proxy)
    }
}
