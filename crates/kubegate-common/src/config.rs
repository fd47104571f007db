//! Static gateway configuration
//!
//! Read once at process start and shared by reference with every cluster
//! provider and connection manager. Nothing here is hot-reloadable: changing
//! the deny policy requires a context switch or a restart.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;
use crate::{Result, DEFAULT_DERIVED_USER_AGENT, VALIDATION_ENABLED_ENV};

// =============================================================================
// Gateway configuration
// =============================================================================

/// Top-level gateway configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Explicit kubeconfig path. Mutually exclusive with in-cluster credentials.
    pub kubeconfig: Option<PathBuf>,

    /// How clusters are enumerated and connected to
    pub cluster_provider_strategy: ProviderStrategy,

    /// Cluster name to context name overrides used when materializing a cluster
    pub cluster_contexts: BTreeMap<String, String>,

    /// Refuse to fall back to the gateway's own identity when a caller presents none
    pub require_identity: bool,

    /// Ordered deny list; first match wins
    pub denied_resources: Vec<DenyRule>,

    /// Pre-flight validator settings
    pub validation: ValidationConfig,

    /// Resource used for self-permission checks, exempt from validation
    pub self_review: SelfReviewResource,

    /// Credentials file watching
    pub watch: WatchConfig,

    /// User agent for derived managers; defaults to [`DEFAULT_DERIVED_USER_AGENT`]
    pub user_agent: Option<String>,
}

impl GatewayConfig {
    /// Parse a JSON configuration document and check it for consistency
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot express as types
    pub fn validate(&self) -> Result<()> {
        for (index, rule) in self.denied_resources.iter().enumerate() {
            if rule.version.is_empty() {
                return Err(Error::invalid(format!(
                    "denied_resources[{index}]: version is required"
                )));
            }
        }
        if self.watch.debounce_ms == 0 {
            return Err(Error::invalid("watch.debounce_ms must be greater than zero"));
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(Error::invalid(
                "watch.poll_interval_ms must be greater than zero",
            ));
        }
        Ok(())
    }

    /// User agent attached to derived managers
    pub fn derived_user_agent(&self) -> &str {
        self.user_agent
            .as_deref()
            .unwrap_or(DEFAULT_DERIVED_USER_AGENT)
    }
}

// =============================================================================
// Provider strategy
// =============================================================================

/// Cluster provider strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderStrategy {
    /// In-cluster when service-account material is present, kubeconfig otherwise
    #[default]
    Auto,
    /// Every cluster reachable from the kubeconfig, materialized lazily
    Kubeconfig,
    /// The cluster the gateway runs in
    InCluster,
    /// A single cluster: the kubeconfig's current context
    Disabled,
    /// No shared credentials; every caller supplies server, CA and identity headers
    AuthHeaders,
}

impl std::fmt::Display for ProviderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Kubeconfig => "kubeconfig",
            Self::InCluster => "in-cluster",
            Self::Disabled => "disabled",
            Self::AuthHeaders => "auth-headers",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Deny rules
// =============================================================================

/// A resource type the gateway refuses regardless of caller permission
///
/// An empty `kind` matches every kind in the group/version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DenyRule {
    /// API group; empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Kind; empty denies the whole group/version
    #[serde(default)]
    pub kind: String,
}

impl DenyRule {
    /// Build a rule for a single kind
    pub fn kind(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Build a rule denying a whole group/version
    pub fn group_version(group: &str, version: &str) -> Self {
        Self::kind(group, version, "")
    }

    /// Whether this rule covers the given group/version/kind
    pub fn matches(&self, group: &str, version: &str, kind: &str) -> bool {
        if self.group != group || self.version != version {
            return false;
        }
        self.kind.is_empty() || self.kind == kind
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Pre-flight validator settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Run the validator chain. The deny check runs regardless.
    pub enabled: bool,
}

impl ValidationConfig {
    /// Effective setting, honoring the environment override
    pub fn is_enabled(&self) -> bool {
        self.resolve(std::env::var(VALIDATION_ENABLED_ENV).ok().as_deref())
    }

    /// Effective setting given an override value
    ///
    /// An override that does not parse as a boolean is ignored.
    pub fn resolve(&self, env_override: Option<&str>) -> bool {
        match env_override {
            None => self.enabled,
            Some(raw) => match parse_bool(raw) {
                Some(value) => value,
                None => {
                    warn!(
                        variable = VALIDATION_ENABLED_ENV,
                        value = %raw,
                        "ignoring unparsable validation override"
                    );
                    self.enabled
                }
            },
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

/// The authorization API resource used for self-permission checks
///
/// Requests for this resource skip the validator chain so the authorization
/// validator never re-enters itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfReviewResource {
    /// API group of the review resource
    pub group: String,
    /// Plural resource name
    pub resource: String,
}

impl Default for SelfReviewResource {
    fn default() -> Self {
        Self {
            group: "authorization.k8s.io".to_string(),
            resource: "selfsubjectaccessreviews".to_string(),
        }
    }
}

impl SelfReviewResource {
    /// Whether a group/resource pair is the review resource
    pub fn matches(&self, group: &str, resource: &str) -> bool {
        self.group == group && self.resource == resource
    }
}

// =============================================================================
// Watch
// =============================================================================

/// Credentials file watching
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period after the last observed change before callbacks run
    pub debounce_ms: u64,
    /// How often watched files are fingerprinted when filesystem events are unavailable
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            poll_interval_ms: 250,
        }
    }
}

impl WatchConfig {
    /// Debounce window
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Polling interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
