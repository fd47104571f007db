//! Authorization validator
//!
//! Asks the control plane whether the caller may perform the call. The review
//! request goes out on a client that skips the validator chain, so this
//! validator never re-enters itself. The sub-call is awaited inside the parent
//! call's future and is cancelled with it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{ValidationError, ValidationRequest, Validator};
use crate::review::{AccessCheck, AccessReviewer};

/// Rejects calls the control plane would deny
pub struct AuthorizationValidator {
    reviewer: Arc<dyn AccessReviewer>,
}

impl AuthorizationValidator {
    /// Registry name
    pub const NAME: &'static str = "authorization";

    /// Create a validator over a reviewer
    pub fn new(reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self { reviewer }
    }
}

#[async_trait]
impl Validator for AuthorizationValidator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<(), ValidationError> {
        let coordinate = &request.coordinate;
        let check = AccessCheck {
            verb: coordinate.verb.as_str().to_string(),
            group: coordinate.group.clone(),
            version: coordinate.version.clone(),
            resource: coordinate.resource.clone(),
            namespace: coordinate.namespace.clone(),
            name: coordinate.name.clone(),
            subresource: coordinate.subresource.clone(),
        };

        match self.reviewer.can_i(&check).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ValidationError::forbidden(
                &check.verb,
                &check.resource,
                check.namespace.as_deref(),
            )),
            Err(e) => {
                warn!(
                    verb = %check.verb,
                    resource = %check.resource,
                    error = %e,
                    "permission check failed, allowing call"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::MockAccessReviewer;
    use crate::validation::testing::request;
    use crate::validation::ValidationCode;
    use http::Method;
    use kube::core::GroupVersionKind;

    fn delete_pod() -> ValidationRequest {
        request(
            Method::DELETE,
            "/api/v1/namespaces/team-a/pods/web-0",
            GroupVersionKind::gvk("", "v1", "Pod"),
            None,
        )
    }

    #[tokio::test]
    async fn test_allowed_passes_with_request_attributes() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_can_i()
            .withf(|c| {
                c.verb == "delete"
                    && c.group.is_empty()
                    && c.resource == "pods"
                    && c.namespace.as_deref() == Some("team-a")
                    && c.name.as_deref() == Some("web-0")
            })
            .times(1)
            .returning(|_| Ok(true));
        let validator = AuthorizationValidator::new(Arc::new(reviewer));
        assert!(validator.validate(&delete_pod()).await.is_ok());
    }

    #[tokio::test]
    async fn test_denied_is_forbidden() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_can_i().returning(|_| Ok(false));
        let validator = AuthorizationValidator::new(Arc::new(reviewer));
        let err = validator.validate(&delete_pod()).await.unwrap_err();
        assert_eq!(err.code, ValidationCode::Forbidden);
        assert_eq!(err.message, "cannot delete pods in namespace \"team-a\"");
    }

    #[tokio::test]
    async fn test_review_failure_fails_open() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_can_i()
            .returning(|_| Err(kube::Error::Service("connection refused".into())));
        let validator = AuthorizationValidator::new(Arc::new(reviewer));
        assert!(validator.validate(&delete_pod()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cluster_scoped_message() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_can_i().returning(|_| Ok(false));
        let validator = AuthorizationValidator::new(Arc::new(reviewer));
        let req = request(
            Method::DELETE,
            "/apis/rbac.authorization.k8s.io/v1/clusterroles/admin",
            GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole"),
            None,
        );
        let err = validator.validate(&req).await.unwrap_err();
        assert_eq!(err.message, "cannot delete clusterroles (cluster-scoped)");
    }
}
