//! REST mapping between resources and kinds
//!
//! Backed by a manager's discovery cache; invalidating the cache invalidates
//! the mapper with it.

use std::sync::Arc;

use async_trait::async_trait;
use kube::core::{GroupVersionKind, GroupVersionResource};
use kube::discovery::{ApiResource, Scope};

use crate::discovery::{CachedDiscovery, DiscoveredResource};

/// Mapping failure
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MappingError {
    /// Discovery succeeded but does not serve the type
    #[error("no matches for {0}")]
    NoMatch(String),

    /// Discovery itself could not be completed
    #[error("discovery failed: {0}")]
    Discovery(String),
}

impl MappingError {
    /// Whether this is an explicit "type not served" result
    pub fn is_no_match(&self) -> bool {
        matches!(self, Self::NoMatch(_))
    }
}

/// Resolved wire-level mapping of a kind
#[derive(Clone, Debug)]
pub struct RestMapping {
    /// Group/version/kind
    pub gvk: GroupVersionKind,
    /// Dynamic API resource description used to build clients
    pub resource: ApiResource,
    /// Namespaced or cluster-scoped
    pub scope: Scope,
}

impl RestMapping {
    /// Build from a discovered resource
    pub fn from_discovered(found: &DiscoveredResource) -> Self {
        let gvk = GroupVersionKind::gvk(&found.group, &found.version, &found.kind);
        Self {
            resource: ApiResource::from_gvk_with_plural(&gvk, &found.plural),
            gvk,
            scope: if found.namespaced {
                Scope::Namespaced
            } else {
                Scope::Cluster
            },
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn is_namespaced(&self) -> bool {
        matches!(self.scope, Scope::Namespaced)
    }
}

/// Resource/kind lookups
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestMapper: Send + Sync {
    /// Kind served for a group/version/resource
    async fn kind_for(&self, gvr: &GroupVersionResource) -> Result<GroupVersionKind, MappingError>;

    /// Full mapping for a group/kind, optionally pinned to a version
    async fn rest_mapping(
        &self,
        group: &str,
        kind: &str,
        version: &str,
    ) -> Result<RestMapping, MappingError>;
}

/// Mapper that defers to a discovery cache, fetching on first use
pub struct DeferredRestMapper {
    discovery: Arc<CachedDiscovery>,
}

impl DeferredRestMapper {
    /// Create a mapper over the given cache
    pub fn new(discovery: Arc<CachedDiscovery>) -> Self {
        Self { discovery }
    }
}

#[async_trait]
impl RestMapper for DeferredRestMapper {
    async fn kind_for(&self, gvr: &GroupVersionResource) -> Result<GroupVersionKind, MappingError> {
        let snapshot = self.discovery.snapshot().await?;
        snapshot
            .by_resource(&gvr.group, &gvr.version, &gvr.resource)
            .map(|found| GroupVersionKind::gvk(&found.group, &found.version, &found.kind))
            .ok_or_else(|| MappingError::NoMatch(crate::coordinate::display_gvr(gvr)))
    }

    async fn rest_mapping(
        &self,
        group: &str,
        kind: &str,
        version: &str,
    ) -> Result<RestMapping, MappingError> {
        let snapshot = self.discovery.snapshot().await?;
        snapshot
            .by_kind(group, version, kind)
            .map(RestMapping::from_discovered)
            .ok_or_else(|| {
                let group_kind = if group.is_empty() {
                    kind.to_string()
                } else {
                    format!("{kind}.{group}")
                };
                MappingError::NoMatch(format!("kind {group_kind} in version {version:?}"))
            })
    }
}
