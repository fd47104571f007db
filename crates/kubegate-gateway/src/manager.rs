//! Connection manager
//!
//! One manager owns everything needed to talk to one cluster as one identity:
//! connection parameters, the discovery cache, the REST mapper, the schema
//! cache, and the clients built on the validating transport.
//!
//! ```text
//! GatewayContext ──► ConnectionManager::new ──► Configured ──► close() ──► Closed
//!                           │
//!                           ├─ with_context(name)   rebuild for another context
//!                           └─ derive(identity)     same connection, caller's identity
//! ```
//!
//! Derived managers share connection parameters with their base and nothing
//! else. They never see the base's own credentials.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::USER_AGENT;
use http::{HeaderValue, Request, Response};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use kube::client::{Body, ConfigExt};
use kube::config::{AuthInfo, KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use kubegate_common::GatewayConfig;
use secrecy::SecretString;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{BoxError, Layer, ServiceBuilder};
use tracing::{debug, info};

use crate::access_control::{AccessControlClient, KubeResourceBackend};
use crate::discovery::{CachedDiscovery, KubeDiscoverySource};
use crate::error::{Error, Result};
use crate::identity::{AuthHeaders, CallerIdentity};
use crate::mapper::{DeferredRestMapper, RestMapper};
use crate::policy::DenyPolicy;
use crate::review::{AccessReviewer, KubeAccessReviewer};
use crate::source::{CredentialSource, SourceProbe};
use crate::transport::{Gate, ValidatingLayer};
use crate::validation::schema::{OpenApiSchemaSource, SchemaSource};
use crate::validation::{ValidatorDeps, ValidatorRegistry};

/// Context name reported by managers built from caller-supplied headers
const EXTERNAL_CONTEXT: &str = "external";

/// Connection stack below the validating transport
type BaseService = BoxCloneService<Request<Body>, Response<Incoming>, BoxError>;

// =============================================================================
// Shared construction context
// =============================================================================

/// Process-wide inputs every manager is built from
#[derive(Clone)]
pub struct GatewayContext {
    /// Static gateway configuration
    pub config: Arc<GatewayConfig>,
    /// Validator factories
    pub validators: Arc<ValidatorRegistry>,
    /// Environment facts for credential source resolution
    pub probe: SourceProbe,
}

impl GatewayContext {
    /// Standard validators and the process environment
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Arc::new(config),
            validators: Arc::new(ValidatorRegistry::standard()),
            probe: SourceProbe::from_env(),
        }
    }

    /// Replace the validator registry
    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = Arc::new(validators);
        self
    }

    /// Replace the environment probe
    pub fn with_probe(mut self, probe: SourceProbe) -> Self {
        self.probe = probe;
        self
    }
}

// =============================================================================
// Connection manager
// =============================================================================

/// Clients and caches for one cluster and one identity
pub struct ConnectionManager {
    ctx: GatewayContext,
    /// `None` for managers derived from a caller identity
    source: Option<CredentialSource>,
    context: String,
    config: Config,
    discovery: Arc<CachedDiscovery>,
    mapper: Arc<dyn RestMapper>,
    schemas: Arc<dyn SchemaSource>,
    validation_enabled: bool,
    client: Client,
    resources: AccessControlClient,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Resolve the credential source and build a manager for its current context
    pub async fn new(ctx: GatewayContext) -> Result<Self> {
        let source = CredentialSource::resolve(ctx.config.kubeconfig.as_deref(), &ctx.probe)?;
        let loaded = source.load(None).await?;
        Self::build(ctx, Some(source), loaded.context, loaded.config)
    }

    /// Build a manager for a named context of a known source
    pub async fn for_context(
        ctx: GatewayContext,
        source: CredentialSource,
        context: &str,
    ) -> Result<Self> {
        let loaded = source.load(Some(context)).await?;
        Self::build(ctx, Some(source), loaded.context, loaded.config)
    }

    /// Build a manager entirely from a caller-supplied header bundle
    pub async fn from_auth_headers(ctx: GatewayContext, headers: &AuthHeaders) -> Result<Self> {
        let kubeconfig: Kubeconfig = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": EXTERNAL_CONTEXT,
                "cluster": {
                    "server": headers.server,
                    "certificate-authority-data": STANDARD.encode(&headers.certificate_authority),
                    "insecure-skip-tls-verify": headers.insecure_skip_tls_verify,
                },
            }],
            "users": [{"name": EXTERNAL_CONTEXT, "user": {}}],
            "contexts": [{
                "name": EXTERNAL_CONTEXT,
                "context": {"cluster": EXTERNAL_CONTEXT, "user": EXTERNAL_CONTEXT},
            }],
            "current-context": EXTERNAL_CONTEXT,
        }))
        .map_err(|e| Error::invalid_identity(format!("unusable connection headers: {e}")))?;

        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::invalid_identity(format!("unusable connection headers: {e}")))?;
        config.auth_info = credentials(
            headers.token.as_deref().map(String::as_str),
            headers
                .client_certificate
                .as_deref()
                .zip(headers.client_key.as_deref().map(Vec::as_slice)),
        );
        config.headers = vec![user_agent(&ctx.config)?];

        Self::build(ctx, None, EXTERNAL_CONTEXT.to_string(), config)
    }

    fn build(
        ctx: GatewayContext,
        source: Option<CredentialSource>,
        context: String,
        config: Config,
    ) -> Result<Self> {
        let base = connect(&config)?;
        let namespace = config.default_namespace.clone();
        let raw = Client::new(base.clone(), namespace.clone());

        let discovery = Arc::new(CachedDiscovery::new(Arc::new(KubeDiscoverySource::new(
            raw.clone(),
        ))));
        let mapper: Arc<dyn RestMapper> = Arc::new(DeferredRestMapper::new(discovery.clone()));
        let schemas: Arc<dyn SchemaSource> = Arc::new(OpenApiSchemaSource::new(raw));
        let policy = Arc::new(DenyPolicy::new(ctx.config.denied_resources.clone()));

        // Self reviews see the deny policy but never the validators
        let review_client = Client::new(
            ValidatingLayer::new(Gate::deny_only(policy.clone(), mapper.clone()))
                .layer(base.clone()),
            namespace.clone(),
        );
        let reviewer: Arc<dyn AccessReviewer> = Arc::new(KubeAccessReviewer::new(review_client));

        let validation_enabled = ctx.config.validation.is_enabled();
        let validators = validation_enabled.then(|| {
            ctx.validators.build(&ValidatorDeps {
                mapper: mapper.clone(),
                schemas: schemas.clone(),
                reviewer: reviewer.clone(),
            })
        });
        let gate = Gate::new(
            policy.clone(),
            mapper.clone(),
            validators,
            ctx.config.self_review.clone(),
        );
        let client = Client::new(ValidatingLayer::new(gate).layer(base), namespace.clone());

        let resources = AccessControlClient::new(
            Arc::new(KubeResourceBackend::new(client.clone())),
            mapper.clone(),
            reviewer,
            policy,
            namespace,
        );

        info!(
            context = %context,
            server = %config.cluster_url,
            validation = validation_enabled,
            "connection manager ready"
        );
        Ok(Self {
            ctx,
            source,
            context,
            config,
            discovery,
            mapper,
            schemas,
            validation_enabled,
            client,
            resources,
            closed: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Derivation
    // =========================================================================

    /// Manager acting as the caller
    ///
    /// With no identity, returns this manager unless policy requires one.
    pub async fn derive(self: &Arc<Self>, identity: Option<&CallerIdentity>) -> Result<Arc<Self>> {
        self.ensure_open()?;
        let Some(identity) = identity else {
            if self.ctx.config.require_identity {
                return Err(Error::IdentityRequired);
            }
            return Ok(self.clone());
        };

        let manager = match identity {
            CallerIdentity::External(headers) => {
                Self::from_auth_headers(self.ctx.clone(), headers).await?
            }
            _ => {
                let config = self.derived_config(identity)?;
                Self::build(self.ctx.clone(), None, self.context.clone(), config)?
            }
        };
        debug!(context = %self.context, identity = identity.kind(), "derived connection manager");
        Ok(Arc::new(manager))
    }

    /// Connection parameters of this manager carrying only the caller's credentials
    pub fn derived_config(&self, identity: &CallerIdentity) -> Result<Config> {
        let base = &self.config;
        let mut config = Config::new(base.cluster_url.clone());
        config.default_namespace = base.default_namespace.clone();
        config.root_cert = base.root_cert.clone();
        config.connect_timeout = base.connect_timeout;
        config.read_timeout = base.read_timeout;
        config.write_timeout = base.write_timeout;
        config.accept_invalid_certs = base.accept_invalid_certs;
        config.tls_server_name = base.tls_server_name.clone();
        config.proxy_url = base.proxy_url.clone();
        config.headers = vec![user_agent(&self.ctx.config)?];
        config.auth_info = match identity {
            CallerIdentity::Token(token) => credentials(Some(token.as_str()), None),
            CallerIdentity::ClientCertificate { certificate, key } => {
                credentials(None, Some((certificate.as_slice(), key.as_slice())))
            }
            CallerIdentity::External(_) => {
                return Err(Error::internal(
                    "header-bundle identities carry their own connection",
                ))
            }
        };
        Ok(config)
    }

    /// Manager for another context of the same credential source
    ///
    /// An empty name, or in-cluster credentials, return this manager.
    pub async fn with_context(self: &Arc<Self>, name: &str) -> Result<Arc<Self>> {
        self.ensure_open()?;
        if name.is_empty() {
            return Ok(self.clone());
        }
        match &self.source {
            Some(CredentialSource::InCluster) => Ok(self.clone()),
            Some(source) => {
                let manager = Self::for_context(self.ctx.clone(), source.clone(), name).await?;
                Ok(Arc::new(manager))
            }
            None => Err(Error::configuration(
                "derived managers cannot switch context; switch before deriving",
            )),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Policy-checked resource client
    pub fn resources(&self) -> Result<&AccessControlClient> {
        self.ensure_open()?;
        Ok(&self.resources)
    }

    /// Client whose every request passes the validating transport
    pub fn client(&self) -> Result<Client> {
        self.ensure_open()?;
        Ok(self.client.clone())
    }

    /// REST mapper over this manager's discovery cache
    pub fn rest_mapper(&self) -> Result<Arc<dyn RestMapper>> {
        self.ensure_open()?;
        Ok(self.mapper.clone())
    }

    /// Discovery cache
    pub fn discovery(&self) -> Result<&Arc<CachedDiscovery>> {
        self.ensure_open()?;
        Ok(&self.discovery)
    }

    /// Namespace used when an operation names none
    pub fn default_namespace(&self) -> &str {
        &self.config.default_namespace
    }

    /// Context this manager was loaded for
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Connection parameters, including this manager's credentials
    pub fn connection(&self) -> &Config {
        &self.config
    }

    /// Credential source, for managers not derived from a caller
    pub fn source(&self) -> Option<&CredentialSource> {
        self.source.as_ref()
    }

    /// Whether the validator chain runs on this manager's transport
    pub fn validation_enabled(&self) -> bool {
        self.validation_enabled
    }

    /// Mark discovery and schema caches stale
    pub fn invalidate_caches(&self) {
        self.discovery.invalidate();
        self.schemas.invalidate();
    }

    /// Stop serving; idempotent
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.invalidate_caches();
            debug!(context = %self.context, "connection manager closed");
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

/// Credentials-only auth info; everything else stays unset
fn credentials(token: Option<&str>, certificate: Option<(&[u8], &[u8])>) -> AuthInfo {
    AuthInfo {
        token: token.map(|t| SecretString::from(t.to_string())),
        client_certificate_data: certificate.map(|(cert, _)| STANDARD.encode(cert)),
        client_key_data: certificate.map(|(_, key)| SecretString::from(STANDARD.encode(key))),
        ..Default::default()
    }
}

fn user_agent(config: &GatewayConfig) -> Result<(http::HeaderName, HeaderValue)> {
    let value = HeaderValue::from_str(config.derived_user_agent())
        .map_err(|e| Error::configuration(format!("invalid user agent: {e}")))?;
    Ok((USER_AGENT, value))
}

/// Build the connection stack the validating transport sits on
fn connect(config: &Config) -> Result<BaseService> {
    // Already installed is fine
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let client_error = |e: kube::Error| Error::configuration(format!("failed to build client: {e}"));
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(config.connect_timeout);
    let https = config
        .rustls_https_connector_with_connector(http)
        .map_err(client_error)?;
    let hyper = hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https);

    let stack = ServiceBuilder::new()
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer().map_err(client_error)?)
        .layer(config.extra_headers_layer().map_err(client_error)?)
        .option_layer(config.read_timeout.map(TimeoutLayer::new))
        .map_err(BoxError::from)
        .service(hyper);
    Ok(BoxCloneService::new(stack))
}
