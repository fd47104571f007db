//! Resource coordinate resolution
//!
//! Maps a Kubernetes REST path to {group, version, resource, namespace, name}
//! and infers the verb from the HTTP method and the path shape.
//!
//! Recognized shapes:
//!
//! ```text
//! /api/{version}/{resource}[/{name}[/{subresource}]]
//! /api/{version}/namespaces/{ns}/{resource}[/{name}[/{subresource}]]
//! /apis/{group}/{version}/{resource}[/{name}[/{subresource}]]
//! /apis/{group}/{version}/namespaces/{ns}/{resource}[/{name}[/{subresource}]]
//! ```
//!
//! Anything else (`/healthz`, `/version`, `/openapi/v3`, discovery roots) is
//! not resolvable and must be treated as opaque.

use std::fmt;

use http::{Method, Uri};
use kube::core::GroupVersionResource;

/// API verb inferred for a request
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Read a single object
    Get,
    /// Read a collection
    List,
    /// Stream changes to a collection
    Watch,
    /// POST
    Create,
    /// PUT
    Update,
    /// PATCH (including server-side apply)
    Patch,
    /// DELETE on a single object
    Delete,
    /// DELETE on a collection
    DeleteCollection,
    /// Any other method, lower-cased
    Other(String),
}

impl Verb {
    /// Infer the verb from the HTTP method and whether the path names a collection
    pub fn infer(method: &Method, collection: bool) -> Self {
        match *method {
            Method::GET if collection => Self::List,
            Method::GET => Self::Get,
            Method::POST => Self::Create,
            Method::PUT => Self::Update,
            Method::PATCH => Self::Patch,
            Method::DELETE if collection => Self::DeleteCollection,
            Method::DELETE => Self::Delete,
            _ => Self::Other(method.as_str().to_ascii_lowercase()),
        }
    }

    /// Wire name used in authorization checks
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Watch => "watch",
            Self::Create => "create",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::DeleteCollection => "deletecollection",
            Self::Other(name) => name,
        }
    }

    /// Verbs that carry a request body worth validating
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Patch)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured coordinate of a resource request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceCoordinate {
    /// API group; empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name as it appears in the path
    pub resource: String,
    /// Namespace, when the path is namespaced
    pub namespace: Option<String>,
    /// Object name, absent for collections
    pub name: Option<String>,
    /// Subresource following the name (`status`, `log`, `exec`, ...)
    pub subresource: Option<String>,
    /// Inferred verb
    pub verb: Verb,
}

impl ResourceCoordinate {
    /// Resolve a coordinate from a request path, or `None` for opaque paths
    pub fn resolve(method: &Method, path: &str) -> Option<Self> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let (group, version, resource_index, namespace) = match parts.first().copied() {
            Some("api") if parts.len() >= 3 => {
                if parts[2] == "namespaces" && parts.len() > 4 {
                    ("", parts[1], 4, Some(parts[3]))
                } else {
                    ("", parts[1], 2, None)
                }
            }
            Some("apis") if parts.len() >= 4 => {
                if parts[3] == "namespaces" && parts.len() > 5 {
                    (parts[1], parts[2], 5, Some(parts[4]))
                } else {
                    (parts[1], parts[2], 3, None)
                }
            }
            _ => return None,
        };

        let collection = resource_index == parts.len() - 1;
        Some(Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: parts[resource_index].to_string(),
            namespace: namespace.map(str::to_string),
            name: parts.get(resource_index + 1).map(|s| s.to_string()),
            subresource: parts.get(resource_index + 2).map(|s| s.to_string()),
            verb: Verb::infer(method, collection),
        })
    }

    /// Resolve from a full URI, promoting collection GETs with `watch=true` to `watch`
    pub fn from_request(method: &Method, uri: &Uri) -> Option<Self> {
        let mut coordinate = Self::resolve(method, uri.path())?;
        if coordinate.verb == Verb::List && uri.query().is_some_and(is_watch_query) {
            coordinate.verb = Verb::Watch;
        }
        Some(coordinate)
    }

    /// Group/version/resource of the target
    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::gvr(&self.group, &self.version, &self.resource)
    }

    /// Whether the path names a collection rather than a single object
    pub fn is_collection(&self) -> bool {
        self.name.is_none()
    }
}

fn is_watch_query(query: &str) -> bool {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .any(|(key, value)| key == "watch" && (value == "true" || value == "1"))
}

/// Render a GVR as `group/version/resource`, or `version/resource` for the core group
pub fn display_gvr(gvr: &GroupVersionResource) -> String {
    if gvr.group.is_empty() {
        format!("{}/{}", gvr.version, gvr.resource)
    } else {
        format!("{}/{}/{}", gvr.group, gvr.version, gvr.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_core_namespaced_named_get() {
        let c = ResourceCoordinate::resolve(&Method::GET, "/api/v1/namespaces/default/pods/foo")
            .unwrap();
        assert_eq!(c.group, "");
        assert_eq!(c.version, "v1");
        assert_eq!(c.resource, "pods");
        assert_eq!(c.namespace.as_deref(), Some("default"));
        assert_eq!(c.name.as_deref(), Some("foo"));
        assert_eq!(c.verb, Verb::Get);
    }

    #[test]
    fn test_group_namespaced_collection_list() {
        let c = ResourceCoordinate::resolve(&Method::GET, "/apis/apps/v1/namespaces/ns/deployments")
            .unwrap();
        assert_eq!(c.group, "apps");
        assert_eq!(c.version, "v1");
        assert_eq!(c.resource, "deployments");
        assert_eq!(c.namespace.as_deref(), Some("ns"));
        assert!(c.name.is_none());
        assert_eq!(c.verb, Verb::List);
    }

    #[rstest]
    #[case(Method::GET, "/api/v1/pods", Verb::List)]
    #[case(Method::GET, "/api/v1/namespaces/a/pods/p", Verb::Get)]
    #[case(Method::POST, "/api/v1/namespaces/a/pods", Verb::Create)]
    #[case(Method::PUT, "/api/v1/namespaces/a/pods/p", Verb::Update)]
    #[case(Method::PATCH, "/apis/apps/v1/namespaces/a/deployments/d", Verb::Patch)]
    #[case(Method::DELETE, "/apis/apps/v1/namespaces/a/deployments/d", Verb::Delete)]
    #[case(Method::DELETE, "/apis/apps/v1/namespaces/a/deployments", Verb::DeleteCollection)]
    #[case(Method::OPTIONS, "/api/v1/pods", Verb::Other("options".to_string()))]
    fn test_verb_inference(#[case] method: Method, #[case] path: &str, #[case] expected: Verb) {
        let c = ResourceCoordinate::resolve(&method, path).unwrap();
        assert_eq!(c.verb, expected);
    }

    #[rstest]
    #[case("/")]
    #[case("/healthz")]
    #[case("/version")]
    #[case("/openapi/v3")]
    #[case("/api")]
    #[case("/api/v1")]
    #[case("/apis")]
    #[case("/apis/apps")]
    #[case("/apis/apps/v1")]
    fn test_opaque_paths_do_not_resolve(#[case] path: &str) {
        assert!(ResourceCoordinate::resolve(&Method::GET, path).is_none());
    }

    #[test]
    fn test_namespace_object_is_not_namespaced() {
        let c = ResourceCoordinate::resolve(&Method::GET, "/api/v1/namespaces/foo").unwrap();
        assert_eq!(c.resource, "namespaces");
        assert_eq!(c.name.as_deref(), Some("foo"));
        assert!(c.namespace.is_none());
        assert_eq!(c.verb, Verb::Get);
    }

    #[test]
    fn test_namespaces_collection() {
        let c = ResourceCoordinate::resolve(&Method::GET, "/api/v1/namespaces").unwrap();
        assert_eq!(c.resource, "namespaces");
        assert!(c.is_collection());
        assert_eq!(c.verb, Verb::List);
    }

    #[test]
    fn test_cluster_scoped_group_resource() {
        let c = ResourceCoordinate::resolve(
            &Method::DELETE,
            "/apis/rbac.authorization.k8s.io/v1/clusterroles/admin",
        )
        .unwrap();
        assert_eq!(c.group, "rbac.authorization.k8s.io");
        assert_eq!(c.resource, "clusterroles");
        assert!(c.namespace.is_none());
        assert_eq!(c.name.as_deref(), Some("admin"));
        assert_eq!(c.verb, Verb::Delete);
    }

    #[test]
    fn test_subresource_is_recorded() {
        let c = ResourceCoordinate::resolve(&Method::GET, "/api/v1/namespaces/a/pods/p/log")
            .unwrap();
        assert_eq!(c.resource, "pods");
        assert_eq!(c.name.as_deref(), Some("p"));
        assert_eq!(c.subresource.as_deref(), Some("log"));
        assert_eq!(c.verb, Verb::Get);
    }

    #[test]
    fn test_watch_query_promotes_list() {
        let uri: Uri = "/api/v1/namespaces/a/pods?watch=true&resourceVersion=10"
            .parse()
            .unwrap();
        let c = ResourceCoordinate::from_request(&Method::GET, &uri).unwrap();
        assert_eq!(c.verb, Verb::Watch);

        let uri: Uri = "/api/v1/namespaces/a/pods?watch=false".parse().unwrap();
        let c = ResourceCoordinate::from_request(&Method::GET, &uri).unwrap();
        assert_eq!(c.verb, Verb::List);
    }

    #[test]
    fn test_gvr_display() {
        let core = ResourceCoordinate::resolve(&Method::GET, "/api/v1/pods").unwrap();
        assert_eq!(display_gvr(&core.gvr()), "v1/pods");
        let apps = ResourceCoordinate::resolve(&Method::GET, "/apis/apps/v1/deployments").unwrap();
        assert_eq!(display_gvr(&apps.gvr()), "apps/v1/deployments");
    }
}
