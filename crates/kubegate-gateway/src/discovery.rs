//! Cached API discovery
//!
//! Each connection manager owns one [`CachedDiscovery`]. Readers take an
//! `Arc` snapshot, so an invalidation racing with a lookup yields either the
//! old or the new snapshot, never a partial one. Invalidation bumps a
//! generation counter, and a fetch only marks the cache fresh for the
//! generation it started under.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
use kube::Client;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::mapper::MappingError;

/// One served resource type
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// API group; empty for core
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
    /// Plural resource name
    pub plural: String,
    /// Singular resource name
    pub singular: String,
    /// Whether objects live in a namespace
    pub namespaced: bool,
    /// Verbs the server supports
    pub verbs: Vec<String>,
}

impl DiscoveredResource {
    /// Build from a discovery `APIResource` served under `group_version`
    pub fn from_api_resource(group_version: &str, resource: &APIResource) -> Self {
        let (group, version) = match group_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), group_version.to_string()),
        };
        Self {
            group: resource.group.clone().unwrap_or(group),
            version: resource.version.clone().unwrap_or(version),
            kind: resource.kind.clone(),
            plural: resource.name.clone(),
            singular: resource.singular_name.clone(),
            namespaced: resource.namespaced,
            verbs: resource.verbs.clone(),
        }
    }
}

/// Complete discovery result at one point in time
#[derive(Clone, Debug, Default)]
pub struct DiscoverySnapshot {
    resources: Vec<DiscoveredResource>,
}

impl DiscoverySnapshot {
    /// Wrap a list of resources
    pub fn new(resources: Vec<DiscoveredResource>) -> Self {
        Self { resources }
    }

    /// All discovered resources
    pub fn resources(&self) -> &[DiscoveredResource] {
        &self.resources
    }

    /// Look up by group, resource (plural or singular) and optional version
    pub fn by_resource(&self, group: &str, version: &str, resource: &str) -> Option<&DiscoveredResource> {
        let resource = resource.to_ascii_lowercase();
        self.resources.iter().find(|r| {
            r.group == group
                && (version.is_empty() || r.version == version)
                && (r.plural == resource || (!r.singular.is_empty() && r.singular == resource))
        })
    }

    /// Look up by group, kind and optional version
    pub fn by_kind(&self, group: &str, version: &str, kind: &str) -> Option<&DiscoveredResource> {
        self.resources.iter().find(|r| {
            r.group == group && (version.is_empty() || r.version == version) && r.kind == kind
        })
    }
}

/// Where discovery data comes from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Fetch every served resource type
    async fn fetch(&self) -> Result<Vec<DiscoveredResource>, MappingError>;
}

/// Discovery against a live API server
pub struct KubeDiscoverySource {
    client: Client,
}

impl KubeDiscoverySource {
    /// Create a source using the given (ungated) client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn group_version(&self, group_version: &str) -> Option<Vec<DiscoveredResource>> {
        let list = if group_version.contains('/') {
            self.client.list_api_group_resources(group_version).await
        } else {
            self.client.list_core_api_resources(group_version).await
        };
        match list {
            Ok(list) => Some(
                list.resources
                    .iter()
                    // "pods/log" and friends are subresources, not types
                    .filter(|r| !r.name.contains('/'))
                    .map(|r| DiscoveredResource::from_api_resource(group_version, r))
                    .collect(),
            ),
            Err(e) => {
                warn!(group_version = %group_version, error = %e, "skipping group version that failed discovery");
                None
            }
        }
    }
}

#[async_trait]
impl DiscoverySource for KubeDiscoverySource {
    async fn fetch(&self) -> Result<Vec<DiscoveredResource>, MappingError> {
        let core = self
            .client
            .list_core_api_versions()
            .await
            .map_err(|e| MappingError::Discovery(e.to_string()))?;
        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|e| MappingError::Discovery(e.to_string()))?;

        let mut group_versions = core.versions;
        for group in groups.groups {
            group_versions.extend(group.versions.into_iter().map(|v| v.group_version));
        }

        let resources: Vec<_> = join_all(group_versions.iter().map(|gv| self.group_version(gv)))
            .await
            .into_iter()
            .flatten()
            .flatten()
            .collect();
        debug!(
            group_versions = group_versions.len(),
            resources = resources.len(),
            "discovery fetched"
        );
        Ok(resources)
    }
}

/// Discovery cache with explicit invalidation
pub struct CachedDiscovery {
    source: Arc<dyn DiscoverySource>,
    snapshot: RwLock<Option<Arc<DiscoverySnapshot>>>,
    /// Bumped by every invalidation
    generation: AtomicU64,
    /// Generation the cached snapshot was fetched under
    fetched: AtomicU64,
    refresh: Mutex<()>,
}

impl CachedDiscovery {
    /// Create an empty cache over a source
    pub fn new(source: Arc<dyn DiscoverySource>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(None),
            generation: AtomicU64::new(1),
            fetched: AtomicU64::new(0),
            refresh: Mutex::new(()),
        }
    }

    /// Whether the cached snapshot reflects the latest fetch since the last invalidation
    pub fn fresh(&self) -> bool {
        self.fetched.load(Ordering::Acquire) == self.generation.load(Ordering::Acquire)
    }

    /// Mark the cache stale; the next read refetches
    pub fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "discovery cache invalidated");
    }

    /// Current snapshot, fetching when empty or stale
    ///
    /// A failed refresh falls back to the previous snapshot when one exists.
    /// A fetch overtaken by an invalidation still answers its reader but
    /// leaves the cache stale.
    pub async fn snapshot(&self) -> Result<Arc<DiscoverySnapshot>, MappingError> {
        if self.fresh() {
            if let Some(snapshot) = self.snapshot.read().await.as_ref() {
                return Ok(snapshot.clone());
            }
        }

        // One refresh at a time; late arrivals reuse the result
        let _guard = self.refresh.lock().await;
        if self.fresh() {
            if let Some(snapshot) = self.snapshot.read().await.as_ref() {
                return Ok(snapshot.clone());
            }
        }

        let generation = self.generation.load(Ordering::Acquire);
        match self.source.fetch().await {
            Ok(resources) => {
                let snapshot = Arc::new(DiscoverySnapshot::new(resources));
                *self.snapshot.write().await = Some(snapshot.clone());
                self.fetched.store(generation, Ordering::Release);
                if !self.fresh() {
                    debug!("discovery cache invalidated during fetch");
                }
                Ok(snapshot)
            }
            Err(e) => match self.snapshot.read().await.as_ref() {
                Some(stale) => {
                    warn!(error = %e, "discovery refresh failed, serving stale snapshot");
                    Ok(stale.clone())
                }
                None => Err(e),
            },
        }
    }

    /// Install a snapshot directly, as a completed fetch would
    #[cfg(test)]
    pub(crate) async fn prime(&self, resources: Vec<DiscoveredResource>) {
        *self.snapshot.write().await = Some(Arc::new(DiscoverySnapshot::new(resources)));
        self.fetched
            .store(self.generation.load(Ordering::Acquire), Ordering::Release);
    }
}
