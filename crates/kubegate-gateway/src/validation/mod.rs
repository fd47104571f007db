//! Pre-flight validator chain
//!
//! Validators run in registration order against a read-only
//! [`ValidationRequest`]. The first failure aborts the chain.
//!
//! Validators are fail-open for infrastructure problems (a cache miss, an
//! unreachable authorization API) and fail-closed for explicit negative
//! answers (a kind the server does not serve, a denied permission check).
//!
//! The standard registry holds, in order:
//! 1. `resource`: the kind must be served by the cluster
//! 2. `schema`: mutating bodies must fit the kind's published schema
//! 3. `authorization`: the caller must be permitted the verb

pub mod authorization;
pub mod resource;
pub mod schema;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use kube::core::GroupVersionKind;
use tracing::debug;

use crate::coordinate::{ResourceCoordinate, Verb};
use crate::error::{Error, Result};
use crate::mapper::RestMapper;
use crate::review::AccessReviewer;
use schema::SchemaSource;

pub use authorization::AuthorizationValidator;
pub use resource::ResourceValidator;
pub use schema::{OpenApiSchemaSource, SchemaValidator};

// =============================================================================
// Errors
// =============================================================================

/// Category of a validation failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValidationCode {
    /// The kind is not served by the cluster
    ResourceNotFound,
    /// The body does not decode or does not fit the kind's schema
    SchemaInvalid,
    /// The control plane denied the caller the verb
    Forbidden,
    /// The validator itself misbehaved
    Internal,
}

impl ValidationCode {
    /// Stable machine-readable code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::SchemaInvalid => "SCHEMA_INVALID",
            Self::Forbidden => "FORBIDDEN",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validator's rejection of a call
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("validation error [{code}]: {message}")]
pub struct ValidationError {
    /// Failure category
    pub code: ValidationCode,
    /// Human-readable reason
    pub message: String,
    /// Dotted path of the offending field, for schema failures
    pub field: Option<String>,
}

impl ValidationError {
    /// Create an error with the given code and message
    pub fn new(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
        }
    }

    /// The kind is not served by the cluster
    pub fn resource_not_found(api_version: &str, kind: &str) -> Self {
        Self::new(
            ValidationCode::ResourceNotFound,
            format!("resource {api_version}/{kind} does not exist in the cluster"),
        )
    }

    /// A field is not part of the kind's schema
    pub fn invalid_field(field: &str, kind: &str) -> Self {
        Self {
            field: Some(field.to_string()),
            ..Self::new(
                ValidationCode::SchemaInvalid,
                format!("invalid field {field:?} in {kind}"),
            )
        }
    }

    /// The body cannot be decoded or has the wrong shape
    pub fn schema_invalid(reason: impl Into<String>) -> Self {
        Self::new(ValidationCode::SchemaInvalid, reason)
    }

    /// The caller may not perform the verb
    pub fn forbidden(verb: &str, resource: &str, namespace: Option<&str>) -> Self {
        let message = match namespace {
            Some(ns) if !ns.is_empty() => format!("cannot {verb} {resource} in namespace {ns:?}"),
            _ => format!("cannot {verb} {resource} (cluster-scoped)"),
        };
        Self::new(ValidationCode::Forbidden, message)
    }
}

// =============================================================================
// Request
// =============================================================================

/// Read-only projection of a pending call
#[derive(Clone, Debug)]
pub struct ValidationRequest {
    /// Resolved coordinate
    pub coordinate: ResourceCoordinate,
    /// Kind the coordinate maps to
    pub gvk: GroupVersionKind,
    /// HTTP method
    pub method: Method,
    /// Request path
    pub path: String,
    /// Request content type, if any
    pub content_type: Option<String>,
    /// Buffered body, present only for mutating verbs
    pub body: Option<Bytes>,
}

impl ValidationRequest {
    /// `apiVersion` string of the target kind
    pub fn api_version(&self) -> String {
        if self.gvk.group.is_empty() {
            self.gvk.version.clone()
        } else {
            format!("{}/{}", self.gvk.group, self.gvk.version)
        }
    }

    /// Whether the call mutates state
    pub fn is_mutating(&self) -> bool {
        self.coordinate.verb.is_mutating()
    }

    /// Verb of the call
    pub fn verb(&self) -> &Verb {
        &self.coordinate.verb
    }
}

// =============================================================================
// Validators
// =============================================================================

/// A pre-flight check
#[async_trait]
pub trait Validator: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Accept or reject the call
    async fn validate(&self, request: &ValidationRequest) -> std::result::Result<(), ValidationError>;
}

/// Ordered, fail-fast set of validators
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidatorChain {
    /// Create a chain running validators in the given order
    pub fn new(validators: Vec<Arc<dyn Validator>>) -> Self {
        Self { validators }
    }

    /// Names of the validators in order
    pub fn names(&self) -> Vec<&'static str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// Whether the chain has no validators
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Run every validator, stopping at the first failure
    pub async fn validate(&self, request: &ValidationRequest) -> std::result::Result<(), ValidationError> {
        for validator in &self.validators {
            if let Err(e) = validator.validate(request).await {
                debug!(
                    validator = validator.name(),
                    code = %e.code,
                    resource = %request.coordinate.resource,
                    verb = %request.coordinate.verb,
                    "validation failed"
                );
                return Err(e);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ValidatorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorChain")
            .field("validators", &self.names())
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Capabilities validators are built from
#[derive(Clone)]
pub struct ValidatorDeps {
    /// REST mapper of the owning manager
    pub mapper: Arc<dyn RestMapper>,
    /// Published schemas of the owning manager's cluster
    pub schemas: Arc<dyn SchemaSource>,
    /// Self-permission checks under the owning manager's identity
    pub reviewer: Arc<dyn AccessReviewer>,
}

type ValidatorFactory = Box<dyn Fn(&ValidatorDeps) -> Arc<dyn Validator> + Send + Sync>;

/// Named validator factories, constructed once at startup and shared by reference
pub struct ValidatorRegistry {
    factories: Vec<(&'static str, ValidatorFactory)>,
}

impl ValidatorRegistry {
    /// A registry with no validators
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// The standard registry: resource, schema, authorization
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        // Names are distinct constants; registration cannot collide
        let _ = registry.register(ResourceValidator::NAME, |deps| {
            Arc::new(ResourceValidator::new(deps.mapper.clone()))
        });
        let _ = registry.register(SchemaValidator::NAME, |deps| {
            Arc::new(SchemaValidator::new(deps.schemas.clone()))
        });
        let _ = registry.register(AuthorizationValidator::NAME, |deps| {
            Arc::new(AuthorizationValidator::new(deps.reviewer.clone()))
        });
        registry
    }

    /// Add a factory; names must be unique
    pub fn register<F>(&mut self, name: &'static str, factory: F) -> Result<()>
    where
        F: Fn(&ValidatorDeps) -> Arc<dyn Validator> + Send + Sync + 'static,
    {
        if self.factories.iter().any(|(n, _)| *n == name) {
            return Err(Error::configuration(format!(
                "validator {name:?} is already registered"
            )));
        }
        self.factories.push((name, Box::new(factory)));
        Ok(())
    }

    /// Registered names in order
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|(n, _)| *n).collect()
    }

    /// Instantiate every validator for one manager
    pub fn build(&self, deps: &ValidatorDeps) -> ValidatorChain {
        ValidatorChain::new(self.factories.iter().map(|(_, f)| f(deps)).collect())
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("validators", &self.names())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Build a request for a path, kind and optional JSON body
    pub(crate) fn request(
        method: Method,
        path: &str,
        gvk: GroupVersionKind,
        body: Option<serde_json::Value>,
    ) -> ValidationRequest {
        let coordinate = ResourceCoordinate::resolve(&method, path).unwrap();
        ValidationRequest {
            coordinate,
            gvk,
            method,
            path: path.to_string(),
            content_type: body.as_ref().map(|_| "application/json".to_string()),
            body: body.map(|b| Bytes::from(serde_json::to_vec(&b).unwrap())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::request;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        result: std::result::Result<(), ValidationError>,
    }

    #[async_trait]
    impl Validator for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn validate(&self, _request: &ValidationRequest) -> std::result::Result<(), ValidationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn pod_request() -> ValidationRequest {
        request(
            Method::GET,
            "/api/v1/namespaces/default/pods/foo",
            GroupVersionKind::gvk("", "v1", "Pod"),
            None,
        )
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_failure() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let chain = ValidatorChain::new(vec![
            Arc::new(Recording {
                name: "first",
                calls: first.clone(),
                result: Ok(()),
            }),
            Arc::new(Recording {
                name: "second",
                calls: second.clone(),
                result: Err(ValidationError::forbidden("get", "pods", Some("default"))),
            }),
            Arc::new(Recording {
                name: "third",
                calls: third.clone(),
                result: Ok(()),
            }),
        ]);

        let err = chain.validate(&pod_request()).await.unwrap_err();
        assert_eq!(err.code, ValidationCode::Forbidden);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_passes() {
        let chain = ValidatorChain::default();
        assert!(chain.is_empty());
        assert!(chain.validate(&pod_request()).await.is_ok());
    }

    #[test]
    fn test_standard_registry_order() {
        let registry = ValidatorRegistry::standard();
        assert_eq!(registry.names(), vec!["resource", "schema", "authorization"]);
    }

    #[test]
    fn test_registry_rejects_duplicate_names() {
        let mut registry = ValidatorRegistry::standard();
        let err = registry
            .register("schema", |deps| {
                Arc::new(SchemaValidator::new(deps.schemas.clone()))
            })
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_registries_are_isolated() {
        let mut custom = ValidatorRegistry::empty();
        custom
            .register("resource", |deps| {
                Arc::new(ResourceValidator::new(deps.mapper.clone()))
            })
            .unwrap();
        assert_eq!(custom.names(), vec!["resource"]);
        assert_eq!(ValidatorRegistry::standard().names().len(), 3);
    }

    #[test]
    fn test_error_messages() {
        let e = ValidationError::resource_not_found("example.com/v1", "FakeResource");
        assert_eq!(
            e.to_string(),
            "validation error [RESOURCE_NOT_FOUND]: resource example.com/v1/FakeResource does not exist in the cluster"
        );
        let e = ValidationError::invalid_field("spec.replicaz", "Deployment");
        assert_eq!(e.field.as_deref(), Some("spec.replicaz"));
        assert!(e.to_string().contains("invalid field \"spec.replicaz\" in Deployment"));
        let e = ValidationError::forbidden("delete", "clusterroles", None);
        assert!(e.message.ends_with("(cluster-scoped)"));
    }
}
