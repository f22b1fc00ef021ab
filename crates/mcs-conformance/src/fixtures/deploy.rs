//! Test fixture deployment.
//!
//! Every cluster gets the test namespace, the ClusterIP service with one
//! backend pod behind it, and a request pod to run lookups from. The service is
//! exported from the local (first) cluster only, so the ServiceImport is derived
//! from a single export.

use super::kube_cluster::{mcs_resource, KubeCluster, MCS_API_GROUP, MCS_API_VERSION};
use crate::config::SuiteConfig;
use crate::eventual::{poll_until, Observation, PollPolicy};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fixture deployment errors.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("Failed to create {kind} {name} on cluster {cluster}: {source}")]
    Create {
        kind: &'static str,
        name: String,
        cluster: String,
        #[source]
        source: kube::Error,
    },

    #[error("Failed to delete namespace {namespace} on cluster {cluster}: {source}")]
    Delete {
        namespace: String,
        cluster: String,
        #[source]
        source: kube::Error,
    },

    #[error("Fixture pod did not start: {0}")]
    PodNotRunning(String),

    #[error("Fixture namespace was not deleted: {0}")]
    NamespaceNotDeleted(String),

    #[error("Invalid fixture manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Label set on every fixture object.
const FIXTURE_LABEL: &str = "mcs-conformance";

/// Lower bound on how long cleanup waits for a namespace to finish terminating.
pub const NAMESPACE_DELETE_TIMEOUT: Duration = Duration::from_secs(120);

/// The objects the DNS checks run against.
#[derive(Debug)]
pub struct ConformanceFixture<'a> {
    config: &'a SuiteConfig,
}

impl<'a> ConformanceFixture<'a> {
    pub fn new(config: &'a SuiteConfig) -> Self {
        Self { config }
    }

    /// Create the fixture on every cluster and wait for its pods to run.
    ///
    /// Objects that already exist are left as they are.
    pub async fn deploy(&self, clusters: &[KubeCluster]) -> Result<(), FixtureError> {
        let namespace = &self.config.namespace;

        for (index, cluster) in clusters.iter().enumerate() {
            info!(cluster = %cluster.name(), %namespace, "Deploying fixture");

            let namespaces: Api<Namespace> = Api::all(cluster.client().clone());
            create_or_keep(&namespaces, cluster, "Namespace", &self.namespace_manifest()?).await?;

            let services: Api<Service> = Api::namespaced(cluster.client().clone(), namespace);
            create_or_keep(&services, cluster, "Service", &self.service_manifest()?).await?;

            let pods: Api<Pod> = Api::namespaced(cluster.client().clone(), namespace);
            create_or_keep(&pods, cluster, "Pod", &self.backend_pod_manifest()?).await?;
            create_or_keep(&pods, cluster, "Pod", &self.request_pod_manifest()?).await?;

            if index == 0 {
                info!(cluster = %cluster.name(), service = %self.config.service_name, "Creating ServiceExport");
                let resource = mcs_resource("ServiceExport");
                let exports: Api<DynamicObject> =
                    Api::namespaced_with(cluster.client().clone(), namespace, &resource);
                create_or_keep(&exports, cluster, "ServiceExport", &self.service_export_manifest()?)
                    .await?;
            }
        }

        for cluster in clusters {
            self.await_pod_running(cluster, &self.backend_pod_name()).await?;
            self.await_pod_running(cluster, &self.config.request_pod).await?;
        }

        Ok(())
    }

    /// Delete the test namespace on every cluster and wait until it is gone,
    /// so a later deploy into the same namespace starts clean. Returns the
    /// first failure after attempting all clusters.
    pub async fn cleanup(&self, clusters: &[KubeCluster]) -> Result<(), FixtureError> {
        let namespace = &self.config.namespace;
        let mut first_error = None;
        let mut deleting = Vec::with_capacity(clusters.len());

        for cluster in clusters {
            let api: Api<Namespace> = Api::all(cluster.client().clone());
            match api.delete(namespace, &DeleteParams::default()).await {
                Ok(_) => {
                    info!(cluster = %cluster.name(), %namespace, "Deleting fixture namespace");
                    deleting.push(cluster);
                }
                Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                    debug!(cluster = %cluster.name(), %namespace, "Fixture namespace already gone");
                }
                Err(source) => {
                    warn!(cluster = %cluster.name(), error = %source, "Failed to delete fixture namespace");
                    first_error.get_or_insert(FixtureError::Delete {
                        namespace: namespace.clone(),
                        cluster: cluster.name().to_string(),
                        source,
                    });
                }
            }
        }

        let policy = PollPolicy::new(
            NAMESPACE_DELETE_TIMEOUT.max(self.config.poll.timeout),
            self.config.poll.interval,
        );
        for cluster in deleting {
            let api: Api<Namespace> = Api::all(cluster.client().clone());
            let namespaces = &api;
            let description = format!("namespace {namespace} on cluster {:?}", cluster.name());

            match await_namespace_gone(&policy, &description, || {
                namespace_present(namespaces, namespace)
            })
            .await
            {
                Ok(()) => info!(cluster = %cluster.name(), %namespace, "Deleted fixture namespace"),
                Err(e) => {
                    warn!(cluster = %cluster.name(), error = %e, "Fixture namespace still terminating");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn await_pod_running(
        &self,
        cluster: &KubeCluster,
        pod_name: &str,
    ) -> Result<(), FixtureError> {
        let api: Api<Pod> = Api::namespaced(cluster.client().clone(), &self.config.namespace);
        let pods = &api;
        let description = format!("pod {pod_name} on cluster {:?}", cluster.name());

        poll_until(
            &self.config.poll,
            &description,
            "phase Running",
            || read_pod_phase(pods, pod_name),
            |phase: &String| phase == "Running",
        )
        .await
        .map(|_| ())
        .map_err(|timeout| FixtureError::PodNotRunning(timeout.to_string()))
    }

    fn labels(&self) -> serde_json::Value {
        json!({ "app.kubernetes.io/part-of": FIXTURE_LABEL, "app": self.config.service_name })
    }

    fn namespace_manifest(&self) -> Result<Namespace, serde_json::Error> {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": self.config.namespace,
                "labels": { "app.kubernetes.io/part-of": FIXTURE_LABEL }
            }
        }))
    }

    fn service_manifest(&self) -> Result<Service, serde_json::Error> {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": self.config.service_name,
                "namespace": self.config.namespace,
                "labels": self.labels()
            },
            "spec": {
                "type": "ClusterIP",
                "selector": { "app": self.config.service_name },
                "ports": [{ "name": "tcp", "port": self.config.service_port, "protocol": "TCP" }]
            }
        }))
    }

    fn backend_pod_name(&self) -> String {
        format!("{}-backend", self.config.service_name)
    }

    /// One ready endpoint for the service: busybox `httpd` on the declared port.
    fn backend_pod_manifest(&self) -> Result<Pod, serde_json::Error> {
        let port = self.config.service_port;
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.backend_pod_name(),
                "namespace": self.config.namespace,
                "labels": self.labels()
            },
            "spec": {
                "containers": [{
                    "name": "backend",
                    "image": self.config.request_image,
                    "command": ["httpd", "-f", "-p", port.to_string()],
                    "ports": [{ "name": "tcp", "containerPort": port, "protocol": "TCP" }],
                    "readinessProbe": { "tcpSocket": { "port": port } }
                }],
                "restartPolicy": "Always"
            }
        }))
    }

    fn request_pod_manifest(&self) -> Result<Pod, serde_json::Error> {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": self.config.request_pod,
                "namespace": self.config.namespace,
                "labels": { "app.kubernetes.io/part-of": FIXTURE_LABEL }
            },
            "spec": {
                "containers": [{
                    "name": "request",
                    "image": self.config.request_image,
                    "command": ["sh", "-c", "sleep 3600"]
                }],
                "restartPolicy": "Never"
            }
        }))
    }

    fn service_export_manifest(&self) -> Result<DynamicObject, serde_json::Error> {
        serde_json::from_value(json!({
            "apiVersion": format!("{MCS_API_GROUP}/{MCS_API_VERSION}"),
            "kind": "ServiceExport",
            "metadata": {
                "name": self.config.service_name,
                "namespace": self.config.namespace,
                "labels": self.labels()
            }
        }))
    }
}

async fn create_or_keep<K>(
    api: &Api<K>,
    cluster: &KubeCluster,
    kind: &'static str,
    object: &K,
) -> Result<(), FixtureError>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = object.meta().name.clone().unwrap_or_default();

    match api.create(&PostParams::default(), object).await {
        Ok(_) => {
            info!(cluster = %cluster.name(), kind, %name, "Created");
            Ok(())
        }
        Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
            debug!(cluster = %cluster.name(), kind, %name, "Already exists");
            Ok(())
        }
        Err(source) => Err(FixtureError::Create {
            kind,
            name,
            cluster: cluster.name().to_string(),
            source,
        }),
    }
}

/// Poll `probe` (namespace still present?) until it reports the namespace gone.
async fn await_namespace_gone<F, Fut>(
    policy: &PollPolicy,
    description: &str,
    probe: F,
) -> Result<(), FixtureError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Observation<bool>>,
{
    poll_until(policy, description, "namespace deleted", probe, |present: &bool| {
        !*present
    })
    .await
    .map(|_| ())
    .map_err(|timeout| FixtureError::NamespaceNotDeleted(timeout.to_string()))
}

async fn namespace_present(namespaces: &Api<Namespace>, name: &str) -> Observation<bool> {
    match namespaces.get(name).await {
        Ok(_) => Observation::Value(true),
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => Observation::Value(false),
        Err(e) => Observation::TransportError(e.to_string()),
    }
}

async fn read_pod_phase(pods: &Api<Pod>, name: &str) -> Observation<String> {
    match pods.get(name).await {
        Ok(pod) => match pod.status.and_then(|status| status.phase) {
            Some(phase) => Observation::Value(phase),
            None => Observation::NotReady("pod has no phase yet".to_string()),
        },
        Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
            Observation::NotReady(format!("pod {name} not found"))
        }
        Err(e) => Observation::TransportError(e.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_secs(10), Duration::from_secs(1))
    }

    fn fixture_config() -> SuiteConfig {
        let mut config = SuiteConfig::new("mcs-conformance-test");
        config.service_port = 80;
        config
    }

    #[test]
    fn test_service_manifest() {
        let config = fixture_config();
        let service = ConformanceFixture::new(&config).service_manifest().unwrap();

        assert_eq!(service.metadata.name.as_deref(), Some("hello"));
        assert_eq!(service.metadata.namespace.as_deref(), Some("mcs-conformance-test"));

        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.ports.unwrap()[0].port, 80);
    }

    #[test]
    fn test_backend_pod_is_selected_by_service() {
        let config = fixture_config();
        let fixture = ConformanceFixture::new(&config);
        let service = fixture.service_manifest().unwrap();
        let pod = fixture.backend_pod_manifest().unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("hello-backend"));
        let labels = pod.metadata.labels.unwrap();
        for (key, value) in service.spec.unwrap().selector.unwrap() {
            assert_eq!(labels.get(&key), Some(&value), "selector {key}={value}");
        }

        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 80);
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["httpd".to_string(), "-f".to_string(), "-p".to_string(), "80".to_string()]
        );
        assert!(container.readiness_probe.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_waits_for_terminating_namespace() {
        let reads = Arc::new(AtomicUsize::new(0));
        let reads_clone = reads.clone();
        let start = Instant::now();

        // Present (Terminating) for two reads, then gone.
        await_namespace_gone(&policy(), "namespace ns", move || {
            let reads = reads_clone.clone();
            async move { Observation::Value(reads.fetch_add(1, Ordering::SeqCst) < 2) }
        })
        .await
        .unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_reports_namespace_stuck_terminating() {
        let err = await_namespace_gone(&policy(), "namespace ns", || async {
            Observation::Value(true)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, FixtureError::NamespaceNotDeleted(_)));
        assert!(err.to_string().contains("expected namespace deleted"));
    }

    #[test]
    fn test_request_pod_manifest() {
        let config = fixture_config();
        let pod = ConformanceFixture::new(&config).request_pod_manifest().unwrap();

        assert_eq!(pod.metadata.name.as_deref(), Some("request"));
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some(config.request_image.as_str()));
    }

    #[test]
    fn test_service_export_manifest() {
        let config = fixture_config();
        let export = ConformanceFixture::new(&config)
            .service_export_manifest()
            .unwrap();

        let types = export.types.unwrap();
        assert_eq!(types.api_version, "multicluster.x-k8s.io/v1alpha1");
        assert_eq!(types.kind, "ServiceExport");
        assert_eq!(export.metadata.name.as_deref(), Some("hello"));
    }
}
