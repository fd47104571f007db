//! Kubegate Gateway
//!
//! Mediates every call a caller makes to a Kubernetes API server: resolves the
//! request to a resource coordinate, refuses resource types on the deny list,
//! runs pre-flight validators, and only then forwards it. Each caller gets a
//! connection manager carrying its own identity and nothing of the gateway's.
//!
//! # Architecture
//!
//! ```text
//! caller ──► ClusterProvider ──► ConnectionManager ──► AccessControlClient
//!            (one per process)   (per cluster,          (deny + scope rules)
//!                                 per identity)                │
//!                                                              ▼
//!                                    ValidatingLayer ──► API server
//!                                    (deny + validators)
//! ```
//!
//! # Providers
//!
//! - `kubeconfig`: every cluster in the kubeconfig, built lazily, rebuilt on file change
//! - `in-cluster` / `disabled`: a single cluster
//! - `auth-headers`: callers supply server, CA and identity per request

#![deny(missing_docs)]

pub mod access_control;
pub mod coordinate;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod manager;
pub mod mapper;
pub mod policy;
pub mod provider;
pub mod review;
pub mod source;
pub mod transport;
pub mod validation;
pub mod watch;

pub use access_control::{AccessControlClient, ResourceClient};
pub use coordinate::{ResourceCoordinate, Verb};
pub use error::{Error, Result};
pub use identity::{AuthHeaders, CallerIdentity};
pub use manager::{ConnectionManager, GatewayContext};
pub use policy::{Denial, DenyPolicy};
pub use provider::{create_provider, ClusterEntry, ClusterProvider};
pub use transport::{Gate, ValidatingLayer};
pub use validation::{ValidationCode, ValidationError, ValidatorRegistry};
