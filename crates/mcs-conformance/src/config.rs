//! Conformance suite configuration.
//!
//! Configuration is loaded from environment variables once per run and passed
//! by reference to the driver and fixtures.

use crate::cluster::{PodRef, ServiceRef};
use crate::eventual::PollPolicy;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default exported service name.
pub const DEFAULT_SERVICE_NAME: &str = "hello";

/// Default declared port of the exported service.
pub const DEFAULT_SERVICE_PORT: u16 = 42;

/// Default name of the pod that runs the DNS lookups.
pub const DEFAULT_REQUEST_POD: &str = "request";

/// Default request pod image (ships `sh` and busybox `nslookup`).
pub const DEFAULT_REQUEST_IMAGE: &str = "busybox:1.36";

/// Default poll timeout in seconds.
pub const DEFAULT_POLL_TIMEOUT_SECONDS: u64 = 20;

/// Default poll interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 1;

/// Default fallback tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "mcs_conformance=info";

/// What a check does after one cluster fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Check every cluster and report all failures together.
    #[default]
    CollectAll,
    /// Stop the check at the first non-conformant cluster.
    StopOnFirst,
}

impl std::str::FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collect-all" => Ok(FailurePolicy::CollectAll),
            "stop-on-first" => Ok(FailurePolicy::StopOnFirst),
            other => Err(ConfigError::InvalidValue(format!(
                "MCS_FAILURE_POLICY must be 'collect-all' or 'stop-on-first', got '{other}'"
            ))),
        }
    }
}

/// Configuration for one conformance run.
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    /// Kubeconfig contexts of the member clusters. The first one is the
    /// designated local cluster.
    pub cluster_contexts: Vec<String>,

    /// Namespace the fixture lives in.
    pub namespace: String,

    /// Name of the exported ClusterIP service.
    pub service_name: String,

    /// Declared port of the exported service.
    pub service_port: u16,

    /// Pod used to run lookups, in `namespace` on every cluster.
    pub request_pod: String,

    /// Image of the request pod.
    pub request_image: String,

    /// Timeout and interval of every poll.
    pub poll: PollPolicy,

    /// Behavior after a per-cluster failure.
    pub failure_policy: FailurePolicy,

    /// Fallback tracing filter.
    pub log_filter: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl SuiteConfig {
    /// Defaults for the given namespace, with no cluster contexts.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            cluster_contexts: Vec::new(),
            namespace: namespace.into(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_port: DEFAULT_SERVICE_PORT,
            request_pod: DEFAULT_REQUEST_POD.to_string(),
            request_image: DEFAULT_REQUEST_IMAGE.to_string(),
            poll: PollPolicy::default(),
            failure_policy: FailurePolicy::default(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let namespace = vars
            .get("MCS_NAMESPACE")
            .cloned()
            .unwrap_or_else(generated_namespace);

        let mut config = Self::new(namespace);

        if let Some(contexts) = vars.get("MCS_CLUSTER_CONTEXTS") {
            config.cluster_contexts = contexts
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(name) = vars.get("MCS_SERVICE_NAME") {
            config.service_name = name.clone();
        }

        if let Some(port) = vars.get("MCS_SERVICE_PORT") {
            config.service_port = parse_var("MCS_SERVICE_PORT", port)?;
        }

        if let Some(pod) = vars.get("MCS_REQUEST_POD") {
            config.request_pod = pod.clone();
        }

        if let Some(image) = vars.get("MCS_REQUEST_IMAGE") {
            config.request_image = image.clone();
        }

        let timeout_seconds = match vars.get("MCS_POLL_TIMEOUT_SECONDS") {
            Some(value) => parse_var("MCS_POLL_TIMEOUT_SECONDS", value)?,
            None => DEFAULT_POLL_TIMEOUT_SECONDS,
        };

        let interval_seconds = match vars.get("MCS_POLL_INTERVAL_SECONDS") {
            Some(value) => parse_var("MCS_POLL_INTERVAL_SECONDS", value)?,
            None => DEFAULT_POLL_INTERVAL_SECONDS,
        };

        if interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "MCS_POLL_INTERVAL_SECONDS must be greater than 0".to_string(),
            ));
        }

        config.poll = PollPolicy::new(
            Duration::from_secs(timeout_seconds),
            Duration::from_secs(interval_seconds),
        );

        if let Some(policy) = vars.get("MCS_FAILURE_POLICY") {
            config.failure_policy = policy.parse()?;
        }

        if let Some(filter) = vars.get("MCS_LOG_FILTER") {
            config.log_filter = filter.clone();
        }

        Ok(config)
    }

    /// The exported service under test.
    pub fn service(&self) -> ServiceRef {
        ServiceRef::new(&self.namespace, &self.service_name)
    }

    /// The request pod, identical on every cluster.
    pub fn request_pod(&self) -> PodRef {
        PodRef::new(&self.namespace, &self.request_pod)
    }

    /// Contexts to connect to; a live run needs at least one.
    pub fn require_cluster_contexts(&self) -> Result<&[String], ConfigError> {
        if self.cluster_contexts.is_empty() {
            return Err(ConfigError::MissingEnvVar("MCS_CLUSTER_CONTEXTS".to_string()));
        }
        Ok(&self.cluster_contexts)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{key}='{value}'")))
}

fn generated_namespace() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("mcs-conformance-{}", id.get(..8).unwrap_or(&id))
}
