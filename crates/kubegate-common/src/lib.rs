//! Common types for kubegate: static configuration, telemetry, and constants

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{
    DenyRule, GatewayConfig, ProviderStrategy, SelfReviewResource, ValidationConfig, WatchConfig,
};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable that overrides `validation.enabled`
pub const VALIDATION_ENABLED_ENV: &str = "KUBEGATE_VALIDATION_ENABLED";

/// User agent attached to managers derived from a caller identity
pub const DEFAULT_DERIVED_USER_AGENT: &str = "kubegate/bearer-token-auth";

/// Context name reported by managers built from in-cluster service-account material
pub const IN_CLUSTER_CONTEXT: &str = "in-cluster";

/// Path to the mounted service-account token inside a pod
pub const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
