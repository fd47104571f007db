//! Access-controlled dynamic resource client
//!
//! A decorator over a schema-less resource backend. Binding to a resource type
//! resolves its kind and checks the deny policy once; a type that fails either
//! step yields a handle on which every operation fails locally, with no network
//! call.
//!
//! Namespace handling:
//! - Cluster-scoped kinds never carry a namespace. Supplying one is a usage error.
//! - `list`, `watch` and `delete_collection` on a namespaced kind with no
//!   namespace mean "all namespaces". When a self-permission pre-check says the
//!   caller lacks the cluster-wide verb, the default namespace is used instead.
//! - Every other operation on a namespaced kind uses the given namespace, or
//!   the default namespace when none was given.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, ObjectList, Patch, PatchParams, PostParams,
    WatchEvent, WatchParams,
};
use kube::core::{GroupVersionKind, GroupVersionResource};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::{debug, warn};

use crate::coordinate::{display_gvr, Verb};
use crate::error::{Error, Result};
use crate::mapper::{MappingError, RestMapper};
use crate::policy::{Denial, DenyPolicy};
use crate::review::{AccessCheck, AccessReviewer};

// =============================================================================
// Backend
// =============================================================================

/// Where a resolved operation is sent
#[derive(Clone, Debug)]
pub struct ResourceTarget {
    /// Wire-level description of the resource
    pub resource: ApiResource,
    /// Namespace, `None` for cluster-scoped kinds or all namespaces
    pub namespace: Option<String>,
}

/// Stream of watch events
pub type WatchStream = BoxStream<'static, kube::Result<WatchEvent<DynamicObject>>>;

/// Raw, unchecked resource operations
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// POST an object
    async fn create(
        &self,
        target: &ResourceTarget,
        params: &PostParams,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject>;

    /// GET one object
    async fn get(&self, target: &ResourceTarget, name: &str) -> kube::Result<DynamicObject>;

    /// GET a collection
    async fn list(
        &self,
        target: &ResourceTarget,
        params: &ListParams,
    ) -> kube::Result<ObjectList<DynamicObject>>;

    /// Watch a collection from a resource version
    async fn watch(
        &self,
        target: &ResourceTarget,
        params: &WatchParams,
        version: &str,
    ) -> kube::Result<WatchStream>;

    /// PUT an object
    async fn replace(
        &self,
        target: &ResourceTarget,
        name: &str,
        params: &PostParams,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject>;

    /// DELETE one object
    async fn delete(
        &self,
        target: &ResourceTarget,
        name: &str,
        params: &DeleteParams,
    ) -> kube::Result<()>;

    /// DELETE a collection
    async fn delete_collection(
        &self,
        target: &ResourceTarget,
        params: &DeleteParams,
        list_params: &ListParams,
    ) -> kube::Result<()>;

    /// PATCH an object, including server-side apply
    async fn patch(
        &self,
        target: &ResourceTarget,
        name: &str,
        params: &PatchParams,
        patch: &Patch<serde_json::Value>,
    ) -> kube::Result<DynamicObject>;
}

/// Backend issuing requests through a kube client
pub struct KubeResourceBackend {
    client: Client,
}

impl KubeResourceBackend {
    /// Create a backend over a (gated) client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, target: &ResourceTarget) -> Api<DynamicObject> {
        match &target.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &target.resource),
            None => Api::all_with(self.client.clone(), &target.resource),
        }
    }
}

#[async_trait]
impl ResourceBackend for KubeResourceBackend {
    async fn create(
        &self,
        target: &ResourceTarget,
        params: &PostParams,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        self.api(target).create(params, object).await
    }

    async fn get(&self, target: &ResourceTarget, name: &str) -> kube::Result<DynamicObject> {
        self.api(target).get(name).await
    }

    async fn list(
        &self,
        target: &ResourceTarget,
        params: &ListParams,
    ) -> kube::Result<ObjectList<DynamicObject>> {
        self.api(target).list(params).await
    }

    async fn watch(
        &self,
        target: &ResourceTarget,
        params: &WatchParams,
        version: &str,
    ) -> kube::Result<WatchStream> {
        let stream = self.api(target).watch(params, version).await?;
        Ok(stream.boxed())
    }

    async fn replace(
        &self,
        target: &ResourceTarget,
        name: &str,
        params: &PostParams,
        object: &DynamicObject,
    ) -> kube::Result<DynamicObject> {
        self.api(target).replace(name, params, object).await
    }

    async fn delete(
        &self,
        target: &ResourceTarget,
        name: &str,
        params: &DeleteParams,
    ) -> kube::Result<()> {
        self.api(target).delete(name, params).await.map(|_| ())
    }

    async fn delete_collection(
        &self,
        target: &ResourceTarget,
        params: &DeleteParams,
        list_params: &ListParams,
    ) -> kube::Result<()> {
        self.api(target)
            .delete_collection(params, list_params)
            .await
            .map(|_| ())
    }

    async fn patch(
        &self,
        target: &ResourceTarget,
        name: &str,
        params: &PatchParams,
        patch: &Patch<serde_json::Value>,
    ) -> kube::Result<DynamicObject> {
        self.api(target).patch(name, params, patch).await
    }
}

// =============================================================================
// Access-controlled client
// =============================================================================

/// Entry point handing out policy-checked resource handles
#[derive(Clone)]
pub struct AccessControlClient {
    backend: Arc<dyn ResourceBackend>,
    mapper: Arc<dyn RestMapper>,
    reviewer: Arc<dyn AccessReviewer>,
    policy: Arc<DenyPolicy>,
    default_namespace: String,
}

impl AccessControlClient {
    /// Create a client from its collaborators
    pub fn new(
        backend: Arc<dyn ResourceBackend>,
        mapper: Arc<dyn RestMapper>,
        reviewer: Arc<dyn AccessReviewer>,
        policy: Arc<DenyPolicy>,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            mapper,
            reviewer,
            policy,
            default_namespace: default_namespace.into(),
        }
    }

    /// Namespace used when a namespaced operation names none
    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    /// Bind to a resource type
    ///
    /// Resolution and policy failures are recorded on the handle and returned
    /// by every operation.
    pub async fn resource(&self, gvr: &GroupVersionResource) -> ResourceClient {
        let binding = self.bind(gvr).await;
        if let Err(rejection) = &binding {
            debug!(resource = %display_gvr(gvr), reason = %rejection, "resource handle rejected");
        }
        ResourceClient {
            client: self.clone(),
            binding: binding.map(Arc::new),
            namespace: String::new(),
        }
    }

    async fn bind(&self, gvr: &GroupVersionResource) -> std::result::Result<Binding, Rejection> {
        let unmapped = |source: MappingError| Rejection::Unmapped {
            resource: display_gvr(gvr),
            source,
        };
        let gvk = self.mapper.kind_for(gvr).await.map_err(unmapped)?;
        self.policy.check(&gvk).map_err(Rejection::Denied)?;
        let mapping = self
            .mapper
            .rest_mapping(&gvk.group, &gvk.kind, &gvk.version)
            .await
            .map_err(unmapped)?;
        Ok(Binding {
            namespaced: mapping.is_namespaced(),
            resource: mapping.resource,
            gvk,
        })
    }
}

#[derive(Debug)]
struct Binding {
    gvk: GroupVersionKind,
    resource: ApiResource,
    namespaced: bool,
}

/// Why a resource handle refuses every operation
#[derive(Clone, Debug, thiserror::Error)]
enum Rejection {
    #[error("{resource}: {source}")]
    Unmapped {
        resource: String,
        source: MappingError,
    },
    #[error(transparent)]
    Denied(Denial),
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Unmapped { resource, source } => Error::Mapping { resource, source },
            Rejection::Denied(denial) => Error::Denied(denial),
        }
    }
}

/// Policy-checked handle on one resource type
#[derive(Clone)]
pub struct ResourceClient {
    client: AccessControlClient,
    binding: std::result::Result<Arc<Binding>, Rejection>,
    namespace: String,
}

impl ResourceClient {
    /// Scope subsequent operations to a namespace; empty means none
    pub fn namespace(&self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..self.clone()
        }
    }

    /// Kind this handle resolved to
    pub fn gvk(&self) -> Result<&GroupVersionKind> {
        Ok(&self.binding()?.gvk)
    }

    fn binding(&self) -> Result<&Binding> {
        self.binding
            .as_deref()
            .map_err(|rejection| rejection.clone().into())
    }

    /// Target for single-object operations and creates
    fn target(&self, fallback: Option<&str>) -> Result<ResourceTarget> {
        let binding = self.binding()?;
        let namespace = if binding.namespaced {
            let ns = [self.namespace.as_str(), fallback.unwrap_or_default()]
                .into_iter()
                .find(|ns| !ns.is_empty())
                .unwrap_or(self.client.default_namespace.as_str());
            Some(ns.to_string())
        } else {
            self.ensure_unscoped(binding)?;
            None
        };
        Ok(ResourceTarget {
            resource: binding.resource.clone(),
            namespace,
        })
    }

    /// Target for collection operations, falling back to the default namespace
    /// when the caller cannot act cluster-wide
    async fn collection_target(&self, verb: Verb) -> Result<ResourceTarget> {
        let binding = self.binding()?;
        let namespace = if !binding.namespaced {
            self.ensure_unscoped(binding)?;
            None
        } else if !self.namespace.is_empty() {
            Some(self.namespace.clone())
        } else if self.can_act_cluster_wide(binding, &verb).await {
            None
        } else {
            debug!(
                kind = %binding.gvk.kind,
                verb = %verb,
                namespace = %self.client.default_namespace,
                "no cluster-wide permission, falling back to default namespace"
            );
            Some(self.client.default_namespace.clone())
        };
        Ok(ResourceTarget {
            resource: binding.resource.clone(),
            namespace,
        })
    }

    fn ensure_unscoped(&self, binding: &Binding) -> Result<()> {
        if self.namespace.is_empty() {
            Ok(())
        } else {
            Err(Error::ScopeMismatch {
                kind: binding.gvk.kind.clone(),
                namespace: self.namespace.clone(),
            })
        }
    }

    async fn can_act_cluster_wide(&self, binding: &Binding, verb: &Verb) -> bool {
        let check = AccessCheck::cluster_wide(verb.as_str(), &binding.gvk.group, &binding.resource.plural);
        match self.client.reviewer.can_i(&check).await {
            Ok(allowed) => allowed,
            Err(e) => {
                warn!(verb = %verb, resource = %binding.resource.plural, error = %e, "permission pre-check failed");
                false
            }
        }
    }

    /// Create an object
    pub async fn create(&self, object: &DynamicObject, params: &PostParams) -> Result<DynamicObject> {
        let target = self.target(object.metadata.namespace.as_deref())?;
        self.client
            .backend
            .create(&target, params, object)
            .await
            .map_err(Error::lift)
    }

    /// Read an object
    pub async fn get(&self, name: &str) -> Result<DynamicObject> {
        let target = self.target(None)?;
        self.client.backend.get(&target, name).await.map_err(Error::lift)
    }

    /// List objects
    pub async fn list(&self, params: &ListParams) -> Result<ObjectList<DynamicObject>> {
        let target = self.collection_target(Verb::List).await?;
        self.client.backend.list(&target, params).await.map_err(Error::lift)
    }

    /// Watch objects from a resource version
    pub async fn watch(&self, params: &WatchParams, version: &str) -> Result<WatchStream> {
        let target = self.collection_target(Verb::Watch).await?;
        self.client
            .backend
            .watch(&target, params, version)
            .await
            .map_err(Error::lift)
    }

    /// Replace an object
    pub async fn update(
        &self,
        name: &str,
        object: &DynamicObject,
        params: &PostParams,
    ) -> Result<DynamicObject> {
        let target = self.target(None)?;
        self.client
            .backend
            .replace(&target, name, params, object)
            .await
            .map_err(Error::lift)
    }

    /// Delete an object
    pub async fn delete(&self, name: &str, params: &DeleteParams) -> Result<()> {
        let target = self.target(None)?;
        self.client
            .backend
            .delete(&target, name, params)
            .await
            .map_err(Error::lift)
    }

    /// Delete every object matching the list parameters
    pub async fn delete_collection(
        &self,
        params: &DeleteParams,
        list_params: &ListParams,
    ) -> Result<()> {
        let target = self.collection_target(Verb::DeleteCollection).await?;
        self.client
            .backend
            .delete_collection(&target, params, list_params)
            .await
            .map_err(Error::lift)
    }

    /// Patch an object
    pub async fn patch(
        &self,
        name: &str,
        patch: &Patch<serde_json::Value>,
        params: &PatchParams,
    ) -> Result<DynamicObject> {
        let target = self.target(None)?;
        self.client
            .backend
            .patch(&target, name, params, patch)
            .await
            .map_err(Error::lift)
    }

    /// Server-side apply an object under a field manager
    pub async fn apply(
        &self,
        name: &str,
        object: &DynamicObject,
        field_manager: &str,
        force: bool,
    ) -> Result<DynamicObject> {
        let target = self.target(object.metadata.namespace.as_deref())?;
        let body = serde_json::to_value(object)
            .map_err(|e| Error::internal(format!("failed to encode apply body: {e}")))?;
        let mut params = PatchParams::apply(field_manager);
        params.force = force;
        self.client
            .backend
            .patch(&target, name, &params, &Patch::Apply(body))
            .await
            .map_err(Error::lift)
    }
}
