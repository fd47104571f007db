//! Credential source resolution
//!
//! Exactly one source backs a connection manager: a kubeconfig (explicit path,
//! `KUBECONFIG`, or `~/.kube/config`) or in-cluster service-account material.
//! An explicit kubeconfig while running in a cluster is rejected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Config;
use kubegate_common::{IN_CLUSTER_CONTEXT, SERVICE_ACCOUNT_TOKEN_PATH};
use tracing::debug;

use crate::error::{Error, Result};

/// Environment facts that decide the credential source
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceProbe {
    /// Service-account material and API server environment are present
    pub in_cluster: bool,
    /// Raw `KUBECONFIG` value
    pub kubeconfig_env: Option<String>,
    /// Home directory
    pub home: Option<PathBuf>,
}

impl SourceProbe {
    /// Probe the process environment
    pub fn from_env() -> Self {
        let has = |name: &str| std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false);
        Self {
            in_cluster: has("KUBERNETES_SERVICE_HOST")
                && has("KUBERNETES_SERVICE_PORT")
                && Path::new(SERVICE_ACCOUNT_TOKEN_PATH).exists(),
            kubeconfig_env: std::env::var("KUBECONFIG").ok().filter(|v| !v.is_empty()),
            home: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    /// A probe describing a workstation with only an explicit kubeconfig
    pub fn outside_cluster() -> Self {
        Self::default()
    }
}

/// Connection parameters loaded for one context
pub struct LoadedConfig {
    /// Client configuration
    pub config: Config,
    /// Context the configuration was loaded for
    pub context: String,
}

/// Where credentials come from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    /// Kubeconfig files, merged in order
    Kubeconfig(Vec<PathBuf>),
    /// Mounted service-account token and CA
    InCluster,
}

impl CredentialSource {
    /// Decide the source from an optional explicit path and the environment
    pub fn resolve(explicit: Option<&Path>, probe: &SourceProbe) -> Result<Self> {
        if let Some(path) = explicit {
            if probe.in_cluster {
                return Err(Error::configuration(format!(
                    "kubeconfig file {} cannot be used with in-cluster deployments",
                    path.display()
                )));
            }
            return Ok(Self::Kubeconfig(vec![path.to_path_buf()]));
        }
        if probe.in_cluster {
            return Ok(Self::InCluster);
        }
        if let Some(raw) = &probe.kubeconfig_env {
            let paths: Vec<PathBuf> = std::env::split_paths(raw)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !paths.is_empty() {
                return Ok(Self::Kubeconfig(paths));
            }
        }
        match &probe.home {
            Some(home) => Ok(Self::Kubeconfig(vec![home.join(".kube").join("config")])),
            None => Err(Error::configuration(
                "no kubeconfig found and not running in a cluster",
            )),
        }
    }

    /// Whether credentials come from the pod's service account
    pub fn is_in_cluster(&self) -> bool {
        matches!(self, Self::InCluster)
    }

    /// Files backing this source; empty for in-cluster
    pub fn paths(&self) -> &[PathBuf] {
        match self {
            Self::Kubeconfig(paths) => paths,
            Self::InCluster => &[],
        }
    }

    /// Read and merge the kubeconfig files, skipping missing ones
    pub fn read_kubeconfig(&self) -> Result<Kubeconfig> {
        let paths = match self {
            Self::Kubeconfig(paths) => paths,
            Self::InCluster => {
                return Err(Error::configuration(
                    "in-cluster credentials have no kubeconfig",
                ))
            }
        };

        let mut merged: Option<Kubeconfig> = None;
        for path in paths.iter().filter(|p| p.exists()) {
            let next = Kubeconfig::read_from(path)?;
            merged = Some(match merged {
                Some(current) => current.merge(next)?,
                None => next,
            });
        }
        merged.ok_or_else(|| {
            Error::configuration(format!(
                "unable to read kubeconfig from {}",
                paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }

    /// Load connection parameters for a context, or the current one
    pub async fn load(&self, context: Option<&str>) -> Result<LoadedConfig> {
        if self.is_in_cluster() {
            return Ok(LoadedConfig {
                config: Config::incluster()?,
                context: IN_CLUSTER_CONTEXT.to_string(),
            });
        }

        let kubeconfig = self.read_kubeconfig()?;
        let context = match context {
            Some(name) => name.to_string(),
            None => kubeconfig.current_context.clone().ok_or_else(|| {
                Error::configuration("kubeconfig has no current context")
            })?,
        };
        if !kubeconfig.contexts.iter().any(|c| c.name == context) {
            return Err(Error::configuration(format!(
                "context {context:?} does not exist"
            )));
        }

        let options = KubeConfigOptions {
            context: Some(context.clone()),
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options).await?;
        debug!(context = %context, server = %config.cluster_url, "loaded kubeconfig context");
        Ok(LoadedConfig { config, context })
    }
}

/// Cluster a context points at, when both entries exist
pub fn context_cluster<'a>(kubeconfig: &'a Kubeconfig, context: &str) -> Option<&'a str> {
    let cluster = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context)?
        .context
        .as_ref()?
        .cluster
        .as_str();
    kubeconfig
        .clusters
        .iter()
        .any(|c| c.name == cluster)
        .then_some(cluster)
}

/// Every cluster some context can reach, in context order
pub fn reachable_clusters(kubeconfig: &Kubeconfig) -> Vec<String> {
    let mut clusters: Vec<String> = Vec::new();
    for context in &kubeconfig.contexts {
        if let Some(cluster) = context_cluster(kubeconfig, &context.name) {
            if !clusters.iter().any(|c| c == cluster) {
                clusters.push(cluster.to_string());
            }
        }
    }
    clusters
}

/// Context used to reach a cluster
///
/// A configured override wins; otherwise the first context pointing at the cluster.
pub fn context_for_cluster(
    kubeconfig: &Kubeconfig,
    cluster: &str,
    overrides: &BTreeMap<String, String>,
) -> Result<String> {
    if let Some(context) = overrides.get(cluster) {
        if !kubeconfig.contexts.iter().any(|c| &c.name == context) {
            return Err(Error::configuration(format!(
                "context {context:?} configured for cluster {cluster:?} does not exist"
            )));
        }
        return Ok(context.clone());
    }
    kubeconfig
        .contexts
        .iter()
        .find(|c| context_cluster(kubeconfig, &c.name) == Some(cluster))
        .map(|c| c.name.clone())
        .ok_or_else(|| {
            Error::configuration(format!(
                "no contexts in kubeconfig can access cluster '{cluster}'"
            ))
        })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::Write;

    /// Self-signed CA certificate, base64-encoded PEM
    pub(crate) fn ca_data() -> String {
        use base64::Engine;
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["kubernetes".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(cert.pem())
    }

    /// Kubeconfig with clusters `alpha` and `beta`, a dangling context, and
    /// `alpha-admin` as current context
    pub(crate) fn kubeconfig_yaml(ca: &str) -> String {
        format!(
            r#"apiVersion: v1
kind: Config
current-context: alpha-admin
clusters:
- name: alpha
  cluster:
    server: https://alpha.example.com:6443
    certificate-authority-data: {ca}
    tls-server-name: alpha.internal
- name: beta
  cluster:
    server: https://beta.example.com:6443
    certificate-authority-data: {ca}
contexts:
- name: alpha-admin
  context:
    cluster: alpha
    user: admin
    namespace: team-a
- name: beta-admin
  context:
    cluster: beta
    user: admin
- name: beta-viewer
  context:
    cluster: beta
    user: viewer
- name: orphan
  context:
    cluster: gamma
    user: admin
users:
- name: admin
  user:
    username: admin
    password: hunter2
    as: auditor
- name: viewer
  user:
    token: viewer-token
"#
        )
    }

    /// Write the standard kubeconfig to a temp file
    pub(crate) fn kubeconfig_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(kubeconfig_yaml(&ca_data()).as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }
}
