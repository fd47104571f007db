//! Deny policy evaluation
//!
//! One evaluator shared by the access-controlled resource client and the
//! validating transport, so both enforcement points always agree.

use kube::core::GroupVersionKind;
use kubegate_common::DenyRule;
use tracing::info;

/// A resource type refused by policy
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("resource not allowed: {}", display_gvk(.gvk))]
pub struct Denial {
    /// The denied group/version/kind
    pub gvk: GroupVersionKind,
}

impl Denial {
    /// Create a denial for the given kind
    pub fn new(gvk: GroupVersionKind) -> Self {
        Self { gvk }
    }
}

/// Static, ordered deny list
#[derive(Clone, Debug, Default)]
pub struct DenyPolicy {
    rules: Vec<DenyRule>,
}

impl DenyPolicy {
    /// Create a policy from configured rules
    pub fn new(rules: Vec<DenyRule>) -> Self {
        Self { rules }
    }

    /// A policy that allows everything
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Whether no rules are configured
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule matching the kind, if any
    pub fn matching_rule(&self, gvk: &GroupVersionKind) -> Option<&DenyRule> {
        self.rules
            .iter()
            .find(|rule| rule.matches(&gvk.group, &gvk.version, &gvk.kind))
    }

    /// Refuse the kind if any rule matches
    pub fn check(&self, gvk: &GroupVersionKind) -> Result<(), Denial> {
        match self.matching_rule(gvk) {
            Some(rule) => {
                info!(
                    group = %gvk.group,
                    version = %gvk.version,
                    kind = %gvk.kind,
                    rule_kind = %rule.kind,
                    "resource denied by policy"
                );
                Err(Denial::new(gvk.clone()))
            }
            None => Ok(()),
        }
    }
}

/// Render a GVK the way the API machinery does: `apps/v1, Kind=Deployment`
pub fn display_gvk(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("/{}, Kind={}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}, Kind={}", gvk.group, gvk.version, gvk.kind)
    }
}
