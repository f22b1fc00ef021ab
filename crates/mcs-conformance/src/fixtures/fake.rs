//! In-memory member cluster for exercising the driver without Kubernetes.
//!
//! Responses are scripted per read: each call pops the next scripted response,
//! and the last one repeats forever. Lookups are keyed by the `sh -c` script
//! (for example `nslookup hello.ns.svc.clusterset.local`). Unscripted lookups
//! answer like a resolver that has never heard of the name.

use crate::cluster::{
    ClusterApi, ClusterEndpoint, ClusterError, CommandExecutor, PodRef, ServiceImportRecord,
    ServiceRecord,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum FakeResponse<T> {
    Ok(T),
    NotFound,
    Fail(String),
    /// Never returns, like a stalled exec stream.
    Hang,
}

#[derive(Debug)]
struct Script<T> {
    pending: VecDeque<FakeResponse<T>>,
    last: FakeResponse<T>,
}

impl<T: Clone> Script<T> {
    fn new(responses: Vec<FakeResponse<T>>) -> Self {
        let mut pending: VecDeque<_> = responses.into();
        let last = pending.pop_back().unwrap_or(FakeResponse::NotFound);
        Self { pending, last }
    }

    fn next(&mut self) -> FakeResponse<T> {
        self.pending
            .pop_front()
            .unwrap_or_else(|| self.last.clone())
    }
}

#[derive(Debug, Default)]
struct State {
    service: Option<Script<ServiceRecord>>,
    service_import: Option<Script<ServiceImportRecord>>,
    lookups: HashMap<String, Script<String>>,
    service_reads: usize,
    service_import_reads: usize,
    exec_calls: Vec<(PodRef, Vec<String>)>,
}

/// A scripted member cluster. Clones share state, so a test can keep a handle
/// to inspect calls after handing an endpoint to the driver.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    name: String,
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> ClusterEndpoint {
        let shared = Arc::new(self.clone());
        ClusterEndpoint::new(self.name.clone(), shared.clone(), shared)
    }

    /// ServiceImport already reporting `ips`.
    pub fn with_service_import_ips(self, ips: &[&str]) -> Self {
        self.script_service_import(vec![FakeResponse::Ok(import(ips))])
    }

    /// ServiceImport missing for the first `reads` reads, then reporting `ips`.
    pub fn with_service_import_after(self, reads: usize, ips: &[&str]) -> Self {
        let mut responses = vec![FakeResponse::NotFound; reads];
        responses.push(FakeResponse::Ok(import(ips)));
        self.script_service_import(responses)
    }

    pub fn script_service_import(
        self,
        responses: Vec<FakeResponse<ServiceImportRecord>>,
    ) -> Self {
        self.lock().service_import = Some(Script::new(responses));
        self
    }

    /// Local Service with an assigned cluster IP.
    pub fn with_service_cluster_ip(self, ip: &str) -> Self {
        self.script_service(vec![FakeResponse::Ok(ServiceRecord {
            cluster_ip: Some(ip.to_string()),
        })])
    }

    pub fn script_service(self, responses: Vec<FakeResponse<ServiceRecord>>) -> Self {
        self.lock().service = Some(Script::new(responses));
        self
    }

    /// Answer `sh -c <script>` with the given responses.
    pub fn script_lookup(
        self,
        script: impl Into<String>,
        responses: Vec<FakeResponse<String>>,
    ) -> Self {
        self.lock()
            .lookups
            .insert(script.into(), Script::new(responses));
        self
    }

    /// Answer `nslookup <domain>` with `output` on every attempt.
    pub fn answer_lookup(self, domain: &str, output: impl Into<String>) -> Self {
        self.script_lookup(
            format!("nslookup {domain}"),
            vec![FakeResponse::Ok(output.into())],
        )
    }

    /// Answer `nslookup -type=SRV <domain>` with `output` on every attempt.
    pub fn answer_srv_lookup(self, domain: &str, output: impl Into<String>) -> Self {
        self.script_lookup(
            format!("nslookup -type=SRV {domain}"),
            vec![FakeResponse::Ok(output.into())],
        )
    }

    pub fn service_reads(&self) -> usize {
        self.lock().service_reads
    }

    pub fn service_import_reads(&self) -> usize {
        self.lock().service_import_reads
    }

    /// Every command executed, in order.
    pub fn exec_calls(&self) -> Vec<(PodRef, Vec<String>)> {
        self.lock().exec_calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn import(ips: &[&str]) -> ServiceImportRecord {
    ServiceImportRecord {
        ips: ips.iter().map(|ip| (*ip).to_string()).collect(),
    }
}

async fn resolve<T>(
    response: FakeResponse<T>,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> Result<T, ClusterError> {
    match response {
        FakeResponse::Ok(value) => Ok(value),
        FakeResponse::NotFound => Err(ClusterError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }),
        FakeResponse::Fail(message) => Err(ClusterError::Api(message)),
        FakeResponse::Hang => std::future::pending().await,
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceRecord, ClusterError> {
        let response = {
            let mut state = self.lock();
            state.service_reads += 1;
            state
                .service
                .as_mut()
                .map_or(FakeResponse::NotFound, Script::next)
        };
        resolve(response, "Service", namespace, name).await
    }

    async fn get_service_import(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceImportRecord, ClusterError> {
        let response = {
            let mut state = self.lock();
            state.service_import_reads += 1;
            state
                .service_import
                .as_mut()
                .map_or(FakeResponse::NotFound, Script::next)
        };
        resolve(response, "ServiceImport", namespace, name).await
    }
}

#[async_trait]
impl CommandExecutor for FakeCluster {
    async fn exec(&self, pod: &PodRef, command: &[String]) -> Result<String, ClusterError> {
        let script = command.last().cloned().unwrap_or_default();

        let response = {
            let mut state = self.lock();
            state.exec_calls.push((pod.clone(), command.to_vec()));
            state.lookups.get_mut(&script).map(Script::next)
        };

        match response {
            Some(FakeResponse::Ok(stdout)) => Ok(stdout),
            Some(FakeResponse::NotFound) => Err(ClusterError::NotFound {
                kind: "Pod",
                namespace: pod.namespace.clone(),
                name: pod.name.clone(),
            }),
            Some(FakeResponse::Fail(message)) => Err(ClusterError::Exec {
                pod: pod.to_string(),
                message,
            }),
            Some(FakeResponse::Hang) => std::future::pending().await,
            None => {
                let name = script.rsplit(' ').next().unwrap_or_default();
                Ok(format!(
                    "Server:\t\t10.96.0.10\nAddress:\t10.96.0.10:53\n\n** server can't find {name}: NXDOMAIN\n"
                ))
            }
        }
    }
}

/// Resolver output for an A lookup of `domain` answering `ip`.
pub fn nslookup_answer(domain: &str, ip: &str) -> String {
    format!(
        "Server:\t\t10.96.0.10\nAddress:\t10.96.0.10:53\n\nName:\t{domain}\nAddress: {ip}\n"
    )
}

/// Resolver output for an SRV lookup of `domain` with one `port`/`target` record each.
pub fn nslookup_srv_answer(domain: &str, records: &[(u16, &str)]) -> String {
    let mut output = String::from("Server:\t\t10.96.0.10\nAddress:\t10.96.0.10:53\n\n");
    for (port, target) in records {
        output.push_str(&format!("{domain}\tservice = 0 50 {port} {target}\n"));
    }
    output
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_repeats_last_response() {
        let cluster = FakeCluster::new("c1").with_service_import_after(2, &["10.0.0.5"]);

        for _ in 0..2 {
            let err = cluster.get_service_import("ns", "hello").await.unwrap_err();
            assert!(matches!(err, ClusterError::NotFound { .. }));
        }
        for _ in 0..3 {
            let import = cluster.get_service_import("ns", "hello").await.unwrap();
            assert_eq!(import.first_ip(), Some("10.0.0.5"));
        }
        assert_eq!(cluster.service_import_reads(), 5);
    }

    #[tokio::test]
    async fn test_unscripted_lookup_is_nxdomain() {
        let cluster = FakeCluster::new("c1");
        let pod = PodRef::new("ns", "request");
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            "nslookup nope.ns.svc.cluster.local".to_string(),
        ];

        let stdout = cluster.exec(&pod, &command).await.unwrap();
        assert!(stdout.contains("can't find nope.ns.svc.cluster.local"));
        assert_eq!(cluster.exec_calls(), vec![(pod, command)]);
    }

    #[test]
    fn test_srv_answer_format() {
        let domain = "hello.ns.svc.clusterset.local";
        let output = nslookup_srv_answer(domain, &[(80, domain)]);
        assert!(output.contains(
            "hello.ns.svc.clusterset.local\tservice = 0 50 80 hello.ns.svc.clusterset.local"
        ));
    }
}
