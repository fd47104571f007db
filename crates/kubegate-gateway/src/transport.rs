//! Validating transport
//!
//! A tower layer sitting directly on the connection stack, so every request
//! any client built on it issues passes one gate, including requests kube's
//! own helpers construct for watch, exec and log:
//!
//! ```text
//! Api<K> ──► Client ──► ValidatingService ──► base uri / auth ──► hyper
//!                        │
//!                        ├─ resolve coordinate (opaque paths pass through)
//!                        ├─ map resource to kind
//!                        ├─ deny policy (always)
//!                        └─ validator chain (when enabled, not for self-reviews)
//! ```
//!
//! Responses are returned untouched, so streaming bodies keep streaming.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{header, Request};
use http_body_util::BodyExt;
use kube::client::Body;
use kubegate_common::SelfReviewResource;
use tower::{BoxError, Layer, Service};
use tracing::{debug, trace};

use crate::coordinate::{display_gvr, ResourceCoordinate};
use crate::error::{Error, Result};
use crate::mapper::RestMapper;
use crate::policy::DenyPolicy;
use crate::validation::{ValidationRequest, ValidatorChain};

/// Pre-flight decision shared by every request on one connection stack
pub struct Gate {
    policy: Arc<DenyPolicy>,
    mapper: Arc<dyn RestMapper>,
    validators: Option<ValidatorChain>,
    self_review: SelfReviewResource,
}

impl Gate {
    /// Create a gate; `validators: None` disables validation
    pub fn new(
        policy: Arc<DenyPolicy>,
        mapper: Arc<dyn RestMapper>,
        validators: Option<ValidatorChain>,
        self_review: SelfReviewResource,
    ) -> Self {
        Self {
            policy,
            mapper,
            validators,
            self_review,
        }
    }

    /// Create a gate that only enforces the deny policy
    pub fn deny_only(policy: Arc<DenyPolicy>, mapper: Arc<dyn RestMapper>) -> Self {
        Self::new(policy, mapper, None, SelfReviewResource::default())
    }

    /// Whether the validator chain runs
    pub fn validation_enabled(&self) -> bool {
        self.validators.is_some()
    }

    /// Admit a request, returning it (with its body restored) or the reason it was refused
    pub async fn admit(&self, request: Request<Body>) -> Result<Request<Body>> {
        let Some(coordinate) = ResourceCoordinate::from_request(request.method(), request.uri())
        else {
            trace!(path = %request.uri().path(), "opaque request, passing through");
            return Ok(request);
        };
        if self.policy.is_empty() && self.validators.is_none() {
            return Ok(request);
        }

        let gvr = coordinate.gvr();
        let gvk = self
            .mapper
            .kind_for(&gvr)
            .await
            .map_err(|source| Error::Mapping {
                resource: display_gvr(&gvr),
                source,
            })?;
        self.policy.check(&gvk)?;

        let Some(validators) = &self.validators else {
            return Ok(request);
        };
        if self
            .self_review
            .matches(&coordinate.group, &coordinate.resource)
        {
            trace!("self-permission check, skipping validation");
            return Ok(request);
        }

        let (parts, body) = request.into_parts();
        let (body, buffered) = if coordinate.verb.is_mutating() {
            let bytes = body
                .collect()
                .await
                .map_err(|e| Error::internal(format!("failed to buffer request body: {e}")))?
                .to_bytes();
            (Body::from(bytes.clone()), Some(bytes))
        } else {
            (body, None)
        };

        let validation = ValidationRequest {
            content_type: parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            body: buffered,
            coordinate,
            gvk,
        };
        validators.validate(&validation).await?;
        debug!(
            resource = %validation.coordinate.resource,
            verb = %validation.coordinate.verb,
            "request admitted"
        );

        Ok(Request::from_parts(parts, body))
    }
}

/// Layer installing a [`Gate`] in front of a service
#[derive(Clone)]
pub struct ValidatingLayer {
    gate: Arc<Gate>,
}

impl ValidatingLayer {
    /// Create a layer for the given gate
    pub fn new(gate: Gate) -> Self {
        Self {
            gate: Arc::new(gate),
        }
    }
}

impl<S> Layer<S> for ValidatingLayer {
    type Service = ValidatingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ValidatingService {
            gate: self.gate.clone(),
            inner,
        }
    }
}

/// Service running the gate before delegating
#[derive(Clone)]
pub struct ValidatingService<S> {
    gate: Arc<Gate>,
    inner: S,
}

impl<S> Service<Request<Body>> for ValidatingService<S>
where
    S: Service<Request<Body>> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<S::Response, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        // Use the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let request = gate.admit(request).await.map_err(BoxError::from)?;
            inner.call(request).await.map_err(Into::into)
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use http::Response;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Paths the fake API server has been asked for
    #[derive(Clone, Default)]
    pub(crate) struct WireLog {
        calls: Arc<AtomicUsize>,
        paths: Arc<Mutex<Vec<String>>>,
    }

    impl WireLog {
        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn paths(&self) -> Vec<String> {
            self.paths.lock().unwrap().clone()
        }
    }

    /// Fake API server answering every request with a ConfigMap (or list of them)
    pub(crate) fn fake_api_server(
        log: WireLog,
    ) -> tower::util::BoxCloneService<Request<Body>, Response<Body>, BoxError> {
        tower::util::BoxCloneService::new(tower::service_fn(move |request: Request<Body>| {
            let log = log.clone();
            async move {
                log.calls.fetch_add(1, Ordering::SeqCst);
                log.paths
                    .lock()
                    .unwrap()
                    .push(request.uri().path().to_string());
                let collection = ResourceCoordinate::resolve(request.method(), request.uri().path())
                    .map(|c| c.is_collection() && *request.method() == http::Method::GET)
                    .unwrap_or(false);
                let object = serde_json::json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {"name": "settings", "namespace": "default"},
                    "data": {"mode": "fast"}
                });
                let payload = if collection {
                    serde_json::json!({
                        "apiVersion": "v1",
                        "kind": "ConfigMapList",
                        "metadata": {"resourceVersion": "1"},
                        "items": [object]
                    })
                } else {
                    object
                };
                let response = Response::builder()
                    .status(200)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&payload)?))?;
                Ok::<_, BoxError>(response)
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::discovery::testing::{standard_resources, StaticDiscovery};
    use crate::discovery::CachedDiscovery;
    use crate::mapper::DeferredRestMapper;
    use crate::review::MockAccessReviewer;
    use crate::validation::schema::MockSchemaSource;
    use crate::validation::{ValidationCode, ValidatorDeps, ValidatorRegistry};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
    use kube::Client;
    use kubegate_common::DenyRule;

    fn mapper() -> Arc<dyn RestMapper> {
        let discovery = CachedDiscovery::new(Arc::new(StaticDiscovery(standard_resources())));
        Arc::new(DeferredRestMapper::new(Arc::new(discovery)))
    }

    fn client(gate: Gate, log: &WireLog) -> Client {
        let service = ValidatingLayer::new(gate).layer(fake_api_server(log.clone()));
        Client::new(service, "default")
    }

    fn deny_deployments() -> Arc<DenyPolicy> {
        Arc::new(DenyPolicy::new(vec![DenyRule::kind("apps", "v1", "Deployment")]))
    }

    fn deployment() -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn assert_denied(err: kube::Error) {
        let gateway = Error::from_kube(&err).expect("gateway error");
        assert!(gateway.is_denied(), "unexpected error: {gateway}");
        assert_eq!(
            gateway.to_string(),
            "resource not allowed: apps/v1, Kind=Deployment"
        );
    }

    #[tokio::test]
    async fn test_denied_kind_never_reaches_the_wire() {
        let log = WireLog::default();
        let client = client(Gate::deny_only(deny_deployments(), mapper()), &log);
        let deployments: Api<Deployment> = Api::namespaced(client.clone(), "default");

        assert_denied(deployments.create(&PostParams::default(), &deployment()).await.unwrap_err());
        assert_denied(deployments.get("web").await.unwrap_err());
        assert_denied(deployments.list(&ListParams::default()).await.unwrap_err());
        assert_denied(deployments.delete("web", &DeleteParams::default()).await.unwrap_err());
        assert_eq!(log.calls(), 0);

        let config_maps: Api<ConfigMap> = Api::namespaced(client, "default");
        let cm = config_maps.get("settings").await.unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("settings"));
        let list = config_maps.list(&ListParams::default()).await.unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(log.calls(), 2);
    }

    #[tokio::test]
    async fn test_opaque_paths_pass_through_without_mapping() {
        let log = WireLog::default();
        let mut mapper = crate::mapper::MockRestMapper::new();
        mapper.expect_kind_for().never();
        let gate = Gate::deny_only(deny_deployments(), Arc::new(mapper));
        let mut service = ValidatingLayer::new(gate).layer(fake_api_server(log.clone()));

        let request = Request::get("/version").body(Body::empty()).unwrap();
        tower::ServiceExt::ready(&mut service)
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap();
        assert_eq!(log.paths(), vec!["/version".to_string()]);
    }

    #[tokio::test]
    async fn test_unmapped_resource_fails_closed() {
        let log = WireLog::default();
        let client = client(Gate::deny_only(deny_deployments(), mapper()), &log);
        let request = Request::get("/apis/example.com/v1/namespaces/default/widgets")
            .body(Vec::new())
            .unwrap();
        let err = client
            .request::<serde_json::Value>(request)
            .await
            .unwrap_err();
        assert!(matches!(
            Error::from_kube(&err),
            Some(Error::Mapping { .. })
        ));
        assert_eq!(log.calls(), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_blocks_call() {
        let log = WireLog::default();
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_can_i().returning(|_| Ok(false));
        let mut schemas = MockSchemaSource::new();
        schemas.expect_schema_for().returning(|_| None);
        let mapper = mapper();
        let chain = ValidatorRegistry::standard().build(&ValidatorDeps {
            mapper: mapper.clone(),
            schemas: Arc::new(schemas),
            reviewer: Arc::new(reviewer),
        });
        let gate = Gate::new(
            Arc::new(DenyPolicy::allow_all()),
            mapper,
            Some(chain),
            SelfReviewResource::default(),
        );
        let config_maps: Api<ConfigMap> = Api::namespaced(client(gate, &log), "default");

        let err = config_maps.get("settings").await.unwrap_err();
        let gateway = Error::from_kube(&err).unwrap();
        assert_eq!(
            gateway.validation().map(|v| v.code),
            Some(ValidationCode::Forbidden)
        );
        assert_eq!(log.calls(), 0);
    }

    #[tokio::test]
    async fn test_mutating_body_reaches_validators_and_the_wire() {
        let log = WireLog::default();
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_can_i().returning(|_| Ok(true));
        let mut schemas = MockSchemaSource::new();
        schemas.expect_schema_for().returning(|_| None);
        let mapper = mapper();
        let chain = ValidatorRegistry::standard().build(&ValidatorDeps {
            mapper: mapper.clone(),
            schemas: Arc::new(schemas),
            reviewer: Arc::new(reviewer),
        });
        let gate = Gate::new(
            Arc::new(DenyPolicy::allow_all()),
            mapper,
            Some(chain),
            SelfReviewResource::default(),
        );
        let config_maps: Api<ConfigMap> = Api::namespaced(client(gate, &log), "default");

        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        config_maps.create(&PostParams::default(), &cm).await.unwrap();
        assert_eq!(log.paths(), vec!["/api/v1/namespaces/default/configmaps".to_string()]);
    }

    #[tokio::test]
    async fn test_self_review_skips_validators() {
        let log = WireLog::default();
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_can_i().never();
        let mut schemas = MockSchemaSource::new();
        schemas.expect_schema_for().never();
        let mapper = mapper();
        let chain = ValidatorRegistry::standard().build(&ValidatorDeps {
            mapper: mapper.clone(),
            schemas: Arc::new(schemas),
            reviewer: Arc::new(reviewer),
        });
        let gate = Gate::new(
            Arc::new(DenyPolicy::allow_all()),
            mapper,
            Some(chain),
            SelfReviewResource::default(),
        );
        let client = client(gate, &log);
        let request = Request::post("/apis/authorization.k8s.io/v1/selfsubjectaccessreviews")
            .body(b"{}".to_vec())
            .unwrap();
        client.request::<serde_json::Value>(request).await.unwrap();
        assert_eq!(log.calls(), 1);
    }
}
