//! Error types for the gateway
//!
//! Denials and validation failures are typed so the outer layer can render an
//! actionable message. Errors raised inside the tower stack reach callers as
//! `kube::Error::Service`; [`Error::from_kube`] recovers them.

use std::sync::Arc;

use crate::mapper::MappingError;
use crate::policy::Denial;
use crate::validation::ValidationError;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for gateway operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Startup-fatal configuration problem (conflicting sources, unreadable kubeconfig)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Resource type refused by the deny policy
    #[error(transparent)]
    Denied(#[from] Denial),

    /// A pre-flight validator rejected the call
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The resource type could not be mapped to a kind
    #[error("failed to resolve kind for {resource}: {source}")]
    Mapping {
        /// The group/version/resource that failed to resolve
        resource: String,
        /// Underlying mapping failure
        #[source]
        source: MappingError,
    },

    /// A namespace was supplied for a cluster-scoped kind
    #[error("{kind} is cluster-scoped and cannot be scoped to namespace {namespace:?}")]
    ScopeMismatch {
        /// The cluster-scoped kind
        kind: String,
        /// The namespace the caller supplied
        namespace: String,
    },

    /// Network or remote API failure, passed through with its original detail
    #[error(transparent)]
    Transport(#[from] kube::Error),

    /// Policy mandates a caller identity and none was presented
    #[error("oauth token required")]
    IdentityRequired,

    /// Caller identity headers were present but malformed
    #[error("invalid caller identity: {0}")]
    InvalidIdentity(String),

    /// No cluster with the given name is known
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// The cluster is known but its connection manager failed to build
    #[error("cluster {cluster} is unavailable: {source}")]
    ClusterUnavailable {
        /// Cluster name
        cluster: String,
        /// The build failure recorded for this cluster
        #[source]
        source: Arc<Error>,
    },

    /// The manager or provider has been closed
    #[error("connection manager is closed")]
    Closed,

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid-identity error with the given message
    pub fn invalid_identity(msg: impl Into<String>) -> Self {
        Self::InvalidIdentity(msg.into())
    }

    /// Recover a gateway error raised inside a kube client's service stack
    pub fn from_kube(err: &kube::Error) -> Option<&Error> {
        match err {
            kube::Error::Service(inner) => inner.downcast_ref::<Error>(),
            _ => None,
        }
    }

    /// Convert a kube error, unwrapping gateway errors carried through the service stack
    pub fn lift(err: kube::Error) -> Self {
        match err {
            kube::Error::Service(inner) => match inner.downcast::<Error>() {
                Ok(gateway) => *gateway,
                Err(other) => Self::Transport(kube::Error::Service(other)),
            },
            other => Self::Transport(other),
        }
    }

    /// Whether this error is a policy denial
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    /// Validation failure carried by this error, if any
    pub fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<kube::config::KubeconfigError> for Error {
    fn from(e: kube::config::KubeconfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<kube::config::InClusterError> for Error {
    fn from(e: kube::config::InClusterError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ValidationCode;
    use kube::core::GroupVersionKind;

    fn denial() -> Denial {
        Denial::new(GroupVersionKind::gvk("apps", "v1", "Deployment"))
    }

    #[test]
    fn test_from_kube_recovers_gateway_error() {
        let err = kube::Error::Service(Box::new(Error::Denied(denial())));
        let recovered = Error::from_kube(&err).unwrap();
        assert!(recovered.is_denied());
    }

    #[test]
    fn test_from_kube_ignores_other_service_errors() {
        let err = kube::Error::Service("connection reset".into());
        assert!(Error::from_kube(&err).is_none());
    }

    #[test]
    fn test_lift_unwraps_validation_error() {
        let inner = ValidationError::resource_not_found("example.com/v1", "FakeResource");
        let err = kube::Error::Service(Box::new(Error::Validation(inner)));
        let lifted = Error::lift(err);
        assert_eq!(
            lifted.validation().map(|v| v.code),
            Some(ValidationCode::ResourceNotFound)
        );
    }

    #[test]
    fn test_lift_keeps_transport_errors() {
        let err = kube::Error::Service("tls handshake failed".into());
        let lifted = Error::lift(err);
        assert!(matches!(lifted, Error::Transport(_)));
        assert!(lifted.to_string().contains("tls handshake failed"));
    }

    #[test]
    fn test_denial_message_is_stable() {
        let err = Error::from(denial());
        assert_eq!(
            err.to_string(),
            "resource not allowed: apps/v1, Kind=Deployment"
        );
    }
}
