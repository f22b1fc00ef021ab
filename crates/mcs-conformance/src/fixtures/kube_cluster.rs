//! `kube`-backed member cluster.
//!
//! Reads Services through the typed `k8s-openapi` API, ServiceImports as
//! dynamic objects (`multicluster.x-k8s.io/v1alpha1`), and runs commands via
//! the pod `exec` subresource.

use crate::cluster::{
    ClusterApi, ClusterEndpoint, ClusterError, CommandExecutor, PodRef, ServiceImportRecord,
    ServiceRecord,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ApiResource, AttachParams};
use kube::config::KubeConfigOptions;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Client, Config};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// API group of the Multi-Cluster Services API.
pub const MCS_API_GROUP: &str = "multicluster.x-k8s.io";

/// Served version of the Multi-Cluster Services API.
pub const MCS_API_VERSION: &str = "v1alpha1";

/// Dynamic API resource for an MCS kind (`ServiceImport`, `ServiceExport`).
pub fn mcs_resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind {
        group: MCS_API_GROUP.to_string(),
        version: MCS_API_VERSION.to_string(),
        kind: kind.to_string(),
    })
}

/// A member cluster reached through one kubeconfig context.
#[derive(Clone)]
pub struct KubeCluster {
    name: String,
    client: Client,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl KubeCluster {
    /// Build a client for the given kubeconfig context.
    pub async fn from_context(context: &str) -> Result<Self, ClusterError> {
        install_crypto_provider();

        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..KubeConfigOptions::default()
        };

        let config = Config::from_kubeconfig(&options)
            .await
            .map_err(|e| ClusterError::Connect {
                cluster: context.to_string(),
                message: e.to_string(),
            })?;

        let client = Client::try_from(config).map_err(|e| ClusterError::Connect {
            cluster: context.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self::new(context, client))
    }

    /// Connect to every context, in order.
    pub async fn connect_all(contexts: &[String]) -> Result<Vec<Self>, ClusterError> {
        let mut clusters = Vec::with_capacity(contexts.len());
        for context in contexts {
            clusters.push(Self::from_context(context).await?);
        }
        Ok(clusters)
    }

    pub fn new(name: impl Into<String>, client: Client) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Check that the API server answers.
    pub async fn check_reachable(&self) -> Result<(), ClusterError> {
        let version = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| ClusterError::Connect {
                cluster: self.name.clone(),
                message: e.to_string(),
            })?;

        info!(cluster = %self.name, version = %version.git_version, "API server reachable");
        Ok(())
    }

    pub fn endpoint(&self) -> ClusterEndpoint {
        let shared = Arc::new(self.clone());
        ClusterEndpoint::new(self.name.clone(), shared.clone(), shared)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceRecord, ClusterError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);

        match api.get(name).await {
            Ok(service) => Ok(ServiceRecord {
                cluster_ip: service.spec.and_then(|spec| spec.cluster_ip),
            }),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Err(ClusterError::NotFound {
                kind: "Service",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceImportRecord, ClusterError> {
        let resource = mcs_resource("ServiceImport");
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);

        match api.get(name).await {
            Ok(import) => Ok(service_import_from_data(&import.data)),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => Err(ClusterError::NotFound {
                kind: "ServiceImport",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CommandExecutor for KubeCluster {
    async fn exec(&self, pod: &PodRef, command: &[String]) -> Result<String, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = AttachParams::default().stdout(true).stderr(false);

        debug!(cluster = %self.name, %pod, ?command, "Exec in pod");

        let exec_error = |message: String| ClusterError::Exec {
            pod: pod.to_string(),
            message,
        };

        let mut process = pods
            .exec(&pod.name, command.to_vec(), &params)
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        let mut buf = Vec::new();
        {
            let mut stdout = process
                .stdout()
                .ok_or_else(|| exec_error("stdout was not attached".to_string()))?;

            stdout
                .read_to_end(&mut buf)
                .await
                .map_err(|e| exec_error(e.to_string()))?;
        }

        process
            .join()
            .await
            .map_err(|e| exec_error(e.to_string()))?;

        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Extract `spec.ips` from a ServiceImport body. Missing fields mean no IPs yet.
fn service_import_from_data(data: &serde_json::Value) -> ServiceImportRecord {
    let ips = data
        .get("spec")
        .and_then(|spec| spec.get("ips"))
        .and_then(serde_json::Value::as_array)
        .map(|ips| {
            ips.iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    ServiceImportRecord { ips }
}

fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mcs_resource_plural() {
        let resource = mcs_resource("ServiceImport");
        assert_eq!(resource.group, "multicluster.x-k8s.io");
        assert_eq!(resource.version, "v1alpha1");
        assert_eq!(resource.plural, "serviceimports");
        assert_eq!(resource.api_version, "multicluster.x-k8s.io/v1alpha1");
    }

    #[test]
    fn test_service_import_ips() {
        let data = json!({
            "spec": {
                "type": "ClusterSetIP",
                "ips": ["10.0.0.5", "10.0.0.6"],
                "ports": [{"port": 42, "protocol": "TCP"}]
            }
        });
        assert_eq!(
            service_import_from_data(&data).ips,
            vec!["10.0.0.5", "10.0.0.6"]
        );
    }

    #[test]
    fn test_service_import_without_ips() {
        assert!(service_import_from_data(&json!({})).ips.is_empty());
        assert!(service_import_from_data(&json!({"spec": {"type": "ClusterSetIP"}}))
            .ips
            .is_empty());
    }
}
