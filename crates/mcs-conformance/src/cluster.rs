//! Member cluster handles.
//!
//! A [`ClusterEndpoint`] pairs a cluster name with the two capabilities the
//! checks need: reading Service/ServiceImport objects ([`ClusterApi`]) and
//! running a command inside a pod ([`CommandExecutor`]). The `kube`-backed
//! implementation lives in [`crate::fixtures::KubeCluster`].

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Cluster access errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Kubernetes API request failed: {0}")]
    Api(String),

    #[error("Command execution in pod {pod} failed: {message}")]
    Exec { pod: String, message: String },

    #[error("Failed to connect to cluster {cluster}: {message}")]
    Connect { cluster: String, message: String },
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        ClusterError::Api(err.to_string())
    }
}

/// The parts of a local Service the checks read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub cluster_ip: Option<String>,
}

impl ServiceRecord {
    /// The cluster IP, if one has been assigned. Headless services (`None`) have none.
    pub fn assigned_ip(&self) -> Option<&str> {
        self.cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != "None")
    }
}

/// The parts of a ServiceImport the checks read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceImportRecord {
    pub ips: Vec<String>,
}

impl ServiceImportRecord {
    /// The clusterset IP: the first address the ServiceImport reports.
    pub fn first_ip(&self) -> Option<&str> {
        self.ips.first().map(String::as_str).filter(|ip| !ip.is_empty())
    }
}

/// A (namespace, name) pair identifying a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A (namespace, name) pair identifying the exported Service, with its DNS names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// `<service>.<ns>.svc.clusterset.local`
    pub fn clusterset_domain(&self) -> String {
        format!("{}.{}.svc.clusterset.local", self.name, self.namespace)
    }

    /// `<service>.<ns>.svc.cluster.local`
    pub fn cluster_local_domain(&self) -> String {
        format!("{}.{}.svc.cluster.local", self.name, self.namespace)
    }
}

/// Read access to one cluster's API server.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch a Service. Missing objects are reported as `ClusterError::NotFound`.
    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceRecord, ClusterError>;

    /// Fetch a ServiceImport. Missing objects are reported as `ClusterError::NotFound`.
    async fn get_service_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceImportRecord, ClusterError>;
}

/// Runs a command in a pod and returns its standard output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn exec(&self, pod: &PodRef, command: &[String]) -> Result<String, ClusterError>;
}

/// One member cluster as seen by the driver.
///
/// Cheap to clone; the handles are shared.
#[derive(Clone)]
pub struct ClusterEndpoint {
    name: String,
    api: Arc<dyn ClusterApi>,
    executor: Arc<dyn CommandExecutor>,
}

impl ClusterEndpoint {
    pub fn new(
        name: impl Into<String>,
        api: Arc<dyn ClusterApi>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            name: name.into(),
            api,
            executor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }

    pub fn executor(&self) -> &dyn CommandExecutor {
        self.executor.as_ref()
    }
}

impl fmt::Debug for ClusterEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterEndpoint")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
