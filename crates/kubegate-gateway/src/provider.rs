//! Cluster providers
//!
//! A provider owns the reachable clusters and hands out one connection manager
//! per cluster. The kubeconfig provider keeps a registry whose entries move
//! through explicit states:
//!
//! ```text
//! Uninitialized ──build ok──► Ready(manager)
//!       │
//!       └──────build err────► Failed(error)
//!
//! credentials file change: every entry ──► Uninitialized
//! ```
//!
//! Only the current context's cluster is built at startup; others are built
//! on first lookup from the same kubeconfig.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use kube::config::Kubeconfig;
use kubegate_common::ProviderStrategy;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::CallerIdentity;
use crate::manager::{ConnectionManager, GatewayContext};
use crate::source::{context_cluster, context_for_cluster, reachable_clusters, CredentialSource};
use crate::watch::{ChangeCallback, CredentialsWatcher};

/// Source of per-cluster connection managers
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Strategy this provider implements
    fn strategy(&self) -> ProviderStrategy;

    /// Known cluster names; single-cluster providers report `""`
    fn targets(&self) -> Vec<String>;

    /// Cluster used when a caller names none
    fn default_target(&self) -> String;

    /// Manager for a cluster under the gateway's own identity
    async fn manager(&self, target: &str) -> Result<Arc<ConnectionManager>>;

    /// Manager for a cluster acting as the caller
    async fn derived_manager(
        &self,
        target: &str,
        identity: Option<&CallerIdentity>,
    ) -> Result<Arc<ConnectionManager>> {
        self.manager(target).await?.derive(identity).await
    }

    /// Register a callback run after the credentials source changes
    fn on_change(&self, callback: ChangeCallback);

    /// Stop watchers and managers; idempotent
    fn close(&self);
}

/// Build the provider the configured strategy asks for
pub async fn create_provider(ctx: GatewayContext) -> Result<Arc<dyn ClusterProvider>> {
    let strategy = match ctx.config.cluster_provider_strategy {
        ProviderStrategy::Auto if ctx.probe.in_cluster && ctx.config.kubeconfig.is_none() => {
            ProviderStrategy::InCluster
        }
        ProviderStrategy::Auto => ProviderStrategy::Kubeconfig,
        other => other,
    };
    info!(strategy = %strategy, "creating cluster provider");

    let provider: Arc<dyn ClusterProvider> = match strategy {
        ProviderStrategy::Kubeconfig => {
            if ctx.probe.in_cluster {
                return Err(Error::configuration(
                    "kubeconfig provider cannot be used in in-cluster deployments",
                ));
            }
            Arc::new(KubeconfigProvider::new(ctx).await?)
        }
        ProviderStrategy::InCluster => {
            if !ctx.probe.in_cluster {
                return Err(Error::configuration(
                    "in-cluster provider cannot be used outside of a cluster",
                ));
            }
            Arc::new(SingleClusterProvider::new(ctx, strategy).await?)
        }
        ProviderStrategy::Disabled => Arc::new(SingleClusterProvider::new(ctx, strategy).await?),
        ProviderStrategy::AuthHeaders => Arc::new(AuthHeadersProvider::new(ctx)),
        ProviderStrategy::Auto => {
            return Err(Error::internal("auto strategy was not resolved"));
        }
    };
    Ok(provider)
}

// =============================================================================
// Change callbacks
// =============================================================================

#[derive(Clone, Default)]
struct Callbacks(Arc<RwLock<Vec<ChangeCallback>>>);

impl Callbacks {
    fn push(&self, callback: ChangeCallback) {
        self.0.write().push(callback);
    }

    async fn run(&self) {
        let callbacks = self.0.read().clone();
        for callback in callbacks {
            callback().await;
        }
    }
}

// =============================================================================
// Kubeconfig provider
// =============================================================================

/// State of one registry entry
#[derive(Clone)]
pub enum ClusterEntry {
    /// Known but not built yet
    Uninitialized,
    /// Built and cached
    Ready(Arc<ConnectionManager>),
    /// Build failed; stays failed until the credentials source changes
    Failed(Arc<Error>),
}

/// What the kubeconfig currently says
struct Layout {
    kubeconfig: Kubeconfig,
    clusters: Vec<String>,
    default_cluster: String,
    current_context: String,
}

impl Layout {
    fn read(source: &CredentialSource) -> Result<Self> {
        let kubeconfig = source.read_kubeconfig()?;
        let current_context = kubeconfig
            .current_context
            .clone()
            .ok_or_else(|| Error::configuration("kubeconfig has no current context"))?;
        let default_cluster = context_cluster(&kubeconfig, &current_context)
            .ok_or_else(|| {
                Error::configuration(format!(
                    "current context {current_context:?} does not reference a known cluster"
                ))
            })?
            .to_string();
        Ok(Self {
            clusters: reachable_clusters(&kubeconfig),
            kubeconfig,
            default_cluster,
            current_context,
        })
    }
}

struct Registry {
    ctx: GatewayContext,
    source: CredentialSource,
    layout: RwLock<Layout>,
    entries: DashMap<String, ClusterEntry>,
    build: tokio::sync::Mutex<()>,
    callbacks: Callbacks,
    closed: AtomicBool,
}

/// Forget every entry and record the layout's clusters as unbuilt
fn reset_entries(entries: &DashMap<String, ClusterEntry>, layout: &Layout) {
    entries.clear();
    for cluster in &layout.clusters {
        entries.insert(cluster.clone(), ClusterEntry::Uninitialized);
    }
}

impl Registry {
    fn resolve_target<'a>(&self, target: &'a str) -> Cow<'a, str> {
        if target.is_empty() {
            Cow::Owned(self.layout.read().default_cluster.clone())
        } else {
            Cow::Borrowed(target)
        }
    }

    fn context_for(&self, cluster: &str) -> Result<String> {
        let overrides = &self.ctx.config.cluster_contexts;
        let layout = self.layout.read();
        if cluster == layout.default_cluster && !overrides.contains_key(cluster) {
            return Ok(layout.current_context.clone());
        }
        context_for_cluster(&layout.kubeconfig, cluster, overrides)
    }

    fn settled(&self, cluster: &str) -> Option<Result<Arc<ConnectionManager>>> {
        match self.entries.get(cluster).map(|e| e.value().clone()) {
            None => Some(Err(Error::ClusterNotFound(cluster.to_string()))),
            Some(ClusterEntry::Ready(manager)) => Some(Ok(manager)),
            Some(ClusterEntry::Failed(source)) => Some(Err(Error::ClusterUnavailable {
                cluster: cluster.to_string(),
                source,
            })),
            Some(ClusterEntry::Uninitialized) => None,
        }
    }

    async fn manager(&self, target: &str) -> Result<Arc<ConnectionManager>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let cluster = self.resolve_target(target);
        if let Some(settled) = self.settled(&cluster) {
            return settled;
        }

        // One build at a time; waiters see the finished entry
        let _guard = self.build.lock().await;
        if let Some(settled) = self.settled(&cluster) {
            return settled;
        }

        let built = match self.context_for(&cluster) {
            Ok(context) => {
                ConnectionManager::for_context(self.ctx.clone(), self.source.clone(), &context)
                    .await
            }
            Err(e) => Err(e),
        };
        match built {
            Ok(manager) => {
                let manager = Arc::new(manager);
                self.entries
                    .insert(cluster.to_string(), ClusterEntry::Ready(manager.clone()));
                debug!(cluster = %cluster, context = %manager.context(), "cluster materialized");
                Ok(manager)
            }
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "failed to materialize cluster");
                let source = Arc::new(e);
                self.entries
                    .insert(cluster.to_string(), ClusterEntry::Failed(source.clone()));
                Err(Error::ClusterUnavailable {
                    cluster: cluster.to_string(),
                    source,
                })
            }
        }
    }

    /// React to a credentials change
    async fn rebuild(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        for entry in self.entries.iter() {
            if let ClusterEntry::Ready(manager) = entry.value() {
                manager.invalidate_caches();
            }
        }

        {
            let _guard = self.build.lock().await;
            match Layout::read(&self.source) {
                Ok(layout) => {
                    reset_entries(&self.entries, &layout);
                    info!(
                        clusters = layout.clusters.len(),
                        default = %layout.default_cluster,
                        "cluster registry rebuilt"
                    );
                    *self.layout.write() = layout;
                }
                Err(e) => {
                    warn!(error = %e, "failed to re-read kubeconfig, keeping previous clusters");
                }
            }
        }

        self.callbacks.run().await;
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in self.entries.iter() {
            if let ClusterEntry::Ready(manager) = entry.value() {
                manager.close();
            }
        }
    }
}

/// Every cluster reachable from a kubeconfig, built lazily
pub struct KubeconfigProvider {
    registry: Arc<Registry>,
    watcher: CredentialsWatcher,
}

impl KubeconfigProvider {
    /// Enumerate clusters, build the current context's manager, and start watching
    pub async fn new(ctx: GatewayContext) -> Result<Self> {
        let source = CredentialSource::resolve(ctx.config.kubeconfig.as_deref(), &ctx.probe)?;
        if source.is_in_cluster() {
            return Err(Error::configuration(
                "kubeconfig provider cannot be used in in-cluster deployments",
            ));
        }
        let layout = Layout::read(&source)?;
        let entries = DashMap::new();
        reset_entries(&entries, &layout);
        let watch = ctx.config.watch.clone();
        let registry = Arc::new(Registry {
            ctx,
            source,
            layout: RwLock::new(layout),
            entries,
            build: tokio::sync::Mutex::new(()),
            callbacks: Callbacks::default(),
            closed: AtomicBool::new(false),
        });

        registry.manager("").await?;

        let weak: Weak<Registry> = Arc::downgrade(&registry);
        let on_change: ChangeCallback = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(registry) = weak.upgrade() {
                    registry.rebuild().await;
                }
            })
        });
        let watcher =
            CredentialsWatcher::start(registry.source.paths().to_vec(), &watch, on_change);

        Ok(Self { registry, watcher })
    }

    /// Current state of a cluster's entry
    pub fn entry(&self, cluster: &str) -> Option<ClusterEntry> {
        self.registry.entries.get(cluster).map(|e| e.value().clone())
    }
}

#[async_trait]
impl ClusterProvider for KubeconfigProvider {
    fn strategy(&self) -> ProviderStrategy {
        ProviderStrategy::Kubeconfig
    }

    fn targets(&self) -> Vec<String> {
        self.registry.layout.read().clusters.clone()
    }

    fn default_target(&self) -> String {
        self.registry.layout.read().default_cluster.clone()
    }

    async fn manager(&self, target: &str) -> Result<Arc<ConnectionManager>> {
        self.registry.manager(target).await
    }

    fn on_change(&self, callback: ChangeCallback) {
        self.registry.callbacks.push(callback);
    }

    fn close(&self) {
        self.watcher.close();
        self.registry.close();
    }
}

// =============================================================================
// Single-cluster provider
// =============================================================================

/// One cluster: in-cluster credentials, or the kubeconfig's current context
pub struct SingleClusterProvider {
    strategy: ProviderStrategy,
    manager: Arc<ConnectionManager>,
    callbacks: Callbacks,
    watcher: Option<CredentialsWatcher>,
}

impl SingleClusterProvider {
    /// Build the only manager and, for kubeconfig sources, watch its files
    pub async fn new(ctx: GatewayContext, strategy: ProviderStrategy) -> Result<Self> {
        let watch = ctx.config.watch.clone();
        let manager = Arc::new(ConnectionManager::new(ctx).await?);
        let callbacks = Callbacks::default();

        let paths = manager
            .source()
            .map(|s| s.paths().to_vec())
            .unwrap_or_default();
        let watcher = (!paths.is_empty()).then(|| {
            let weak = Arc::downgrade(&manager);
            let callbacks = callbacks.clone();
            let on_change: ChangeCallback = Arc::new(move || {
                let weak = weak.clone();
                let callbacks = callbacks.clone();
                Box::pin(async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.invalidate_caches();
                    }
                    callbacks.run().await;
                })
            });
            CredentialsWatcher::start(paths, &watch, on_change)
        });

        Ok(Self {
            strategy,
            manager,
            callbacks,
            watcher,
        })
    }
}

#[async_trait]
impl ClusterProvider for SingleClusterProvider {
    fn strategy(&self) -> ProviderStrategy {
        self.strategy
    }

    fn targets(&self) -> Vec<String> {
        vec![String::new()]
    }

    fn default_target(&self) -> String {
        String::new()
    }

    async fn manager(&self, target: &str) -> Result<Arc<ConnectionManager>> {
        if !target.is_empty() {
            return Err(Error::ClusterNotFound(target.to_string()));
        }
        if self.manager.is_closed() {
            return Err(Error::Closed);
        }
        Ok(self.manager.clone())
    }

    fn on_change(&self, callback: ChangeCallback) {
        self.callbacks.push(callback);
    }

    fn close(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.close();
        }
        self.manager.close();
    }
}

// =============================================================================
// Auth-headers provider
// =============================================================================

/// No shared credentials: every caller supplies the connection
pub struct AuthHeadersProvider {
    ctx: GatewayContext,
    closed: AtomicBool,
}

impl AuthHeadersProvider {
    /// Create the provider; nothing is connected until a caller arrives
    pub fn new(ctx: GatewayContext) -> Self {
        Self {
            ctx,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ClusterProvider for AuthHeadersProvider {
    fn strategy(&self) -> ProviderStrategy {
        ProviderStrategy::AuthHeaders
    }

    fn targets(&self) -> Vec<String> {
        vec![String::new()]
    }

    fn default_target(&self) -> String {
        String::new()
    }

    async fn manager(&self, _target: &str) -> Result<Arc<ConnectionManager>> {
        Err(Error::configuration(
            "auth-headers provider has no shared manager; callers must supply connection headers",
        ))
    }

    async fn derived_manager(
        &self,
        target: &str,
        identity: Option<&CallerIdentity>,
    ) -> Result<Arc<ConnectionManager>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if !target.is_empty() {
            return Err(Error::ClusterNotFound(target.to_string()));
        }
        match identity {
            Some(CallerIdentity::External(headers)) => Ok(Arc::new(
                ConnectionManager::from_auth_headers(self.ctx.clone(), headers).await?,
            )),
            Some(other) => Err(Error::invalid_identity(format!(
                "auth-headers provider requires kubernetes-* headers, got {} identity",
                other.kind()
            ))),
            None => Err(Error::IdentityRequired),
        }
    }

    fn on_change(&self, _callback: ChangeCallback) {}

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
