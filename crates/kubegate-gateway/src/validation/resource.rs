//! Resource existence validator

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{ValidationError, ValidationRequest, Validator};
use crate::mapper::{MappingError, RestMapper};

/// Rejects kinds the cluster does not serve
pub struct ResourceValidator {
    mapper: Arc<dyn RestMapper>,
}

impl ResourceValidator {
    /// Registry name
    pub const NAME: &'static str = "resource";

    /// Create a validator over a REST mapper
    pub fn new(mapper: Arc<dyn RestMapper>) -> Self {
        Self { mapper }
    }
}

#[async_trait]
impl Validator for ResourceValidator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<(), ValidationError> {
        let gvk = &request.gvk;
        match self.mapper.rest_mapping(&gvk.group, &gvk.kind, &gvk.version).await {
            Ok(_) => Ok(()),
            Err(MappingError::NoMatch(_)) => Err(ValidationError::resource_not_found(
                &request.api_version(),
                &gvk.kind,
            )),
            Err(e) => {
                warn!(kind = %gvk.kind, error = %e, "resource mapping unavailable, skipping existence check");
                Ok(())
            }
        }
    }
}
