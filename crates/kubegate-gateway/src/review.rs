//! Self-permission checks against the control plane
//!
//! Asks "can the current identity perform verb V on resource R" with a
//! `SelfSubjectAccessReview`. The answer is authoritative; this crate adds no
//! RBAC evaluation of its own.

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

/// Attributes of a permission question
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessCheck {
    /// Verb (`list`, `create`, ...)
    pub verb: String,
    /// API group; empty for core
    pub group: String,
    /// API version; empty for any
    pub version: String,
    /// Plural resource name
    pub resource: String,
    /// Namespace; `None` asks about every namespace
    pub namespace: Option<String>,
    /// Object name
    pub name: Option<String>,
    /// Subresource
    pub subresource: Option<String>,
}

impl AccessCheck {
    /// Question about a verb on a resource across all namespaces
    pub fn cluster_wide(verb: &str, group: &str, resource: &str) -> Self {
        Self {
            verb: verb.to_string(),
            group: group.to_string(),
            resource: resource.to_string(),
            ..Default::default()
        }
    }
}

/// Answers self-permission questions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Whether the current identity is allowed the access
    async fn can_i(&self, check: &AccessCheck) -> Result<bool, kube::Error>;
}

/// Reviewer backed by the authorization API
pub struct KubeAccessReviewer {
    client: Client,
}

impl KubeAccessReviewer {
    /// Create a reviewer issuing reviews through the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccessReviewer for KubeAccessReviewer {
    async fn can_i(&self, check: &AccessCheck) -> Result<bool, kube::Error> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    verb: Some(check.verb.clone()),
                    group: Some(check.group.clone()),
                    version: (!check.version.is_empty()).then(|| check.version.clone()),
                    resource: Some(check.resource.clone()),
                    namespace: check.namespace.clone(),
                    name: check.name.clone(),
                    subresource: check.subresource.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let response = api.create(&PostParams::default(), &review).await?;
        let allowed = response.status.map(|s| s.allowed).unwrap_or(false);
        debug!(
            verb = %check.verb,
            group = %check.group,
            resource = %check.resource,
            namespace = ?check.namespace,
            allowed,
            "self-permission check"
        );
        Ok(allowed)
    }
}
