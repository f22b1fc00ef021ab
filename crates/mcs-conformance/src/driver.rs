//! Multi-cluster DNS conformance checks for ClusterIP services.
//!
//! The driver owns the member cluster set for the run. Each check walks the
//! clusters in order, runs a lookup in the request pod, and polls until the
//! expected answer shows up or the poll times out. Every step ends in a
//! [`ClusterOutcome`](crate::report::ClusterOutcome) in the check's report.

use crate::cluster::{ClusterEndpoint, ServiceImportRecord, ServiceRecord, ServiceRef};
use crate::config::{FailurePolicy, SuiteConfig};
use crate::eventual::{eventually, ContainsSubstring, HasAddress, NonEmpty, Observation};
use crate::report::{CheckKind, CheckOutcome, CheckReport};
use crate::srv::{parse_srv_records, SrvRecord};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("No member clusters configured")]
    NoClusters,
}

/// Build the `sh -c "nslookup ..."` command run inside the request pod.
pub fn nslookup_command(domain: &str, record_type: Option<&str>) -> Vec<String> {
    let lookup = match record_type {
        Some(record_type) => format!("nslookup -type={record_type} {domain}"),
        None => format!("nslookup {domain}"),
    };
    vec!["sh".to_string(), "-c".to_string(), lookup]
}

/// Runs the DNS checks against an ordered set of member clusters.
///
/// The first cluster is the designated local cluster: the ServiceImport is
/// read there and the local-only check runs only there.
#[derive(Debug)]
pub struct ConformanceDriver<'a> {
    config: &'a SuiteConfig,
    local: ClusterEndpoint,
    clusters: Vec<ClusterEndpoint>,
}

impl<'a> ConformanceDriver<'a> {
    pub fn new(
        config: &'a SuiteConfig,
        clusters: Vec<ClusterEndpoint>,
    ) -> Result<Self, DriverError> {
        let local = clusters.first().cloned().ok_or(DriverError::NoClusters)?;
        Ok(Self {
            config,
            local,
            clusters,
        })
    }

    pub fn local_cluster(&self) -> &ClusterEndpoint {
        &self.local
    }

    pub fn clusters(&self) -> &[ClusterEndpoint] {
        &self.clusters
    }

    /// Run one check.
    pub async fn run(&self, check: CheckKind) -> CheckReport {
        match check {
            CheckKind::ClustersetIpResolution => self.check_clusterset_ip_resolution().await,
            CheckKind::ClustersetSrvRecords => self.check_clusterset_srv_records().await,
            CheckKind::LocalServiceResolution => self.check_local_service_resolution().await,
        }
    }

    /// Run every check in order.
    pub async fn run_all(&self) -> Vec<CheckReport> {
        let mut reports = Vec::with_capacity(CheckKind::ALL.len());
        for check in CheckKind::ALL {
            reports.push(self.run(check).await);
        }
        reports
    }

    /// `<service>.<ns>.svc.clusterset.local` resolves to the clusterset IP on
    /// every cluster.
    #[instrument(skip_all, fields(check = "clusterset_ip_resolution"))]
    pub async fn check_clusterset_ip_resolution(&self) -> CheckReport {
        let mut report = CheckReport::new(CheckKind::ClustersetIpResolution);
        let service = self.config.service();

        info!(cluster = %self.local.name(), service = %service.name, "Retrieving ServiceImport");

        let step = format!("retrieve ServiceImport {}/{}", service.namespace, service.name);
        let clusterset_ip = match self.await_clusterset_ip(&self.local, &service).await {
            Ok(ip) => {
                info!(clusterset_ip = %ip, "Found ServiceImport with clusterset IP");
                report.record(self.local.name(), step, CheckOutcome::Pass);
                ip
            }
            Err(diagnostic) => {
                warn!(cluster = %self.local.name(), %diagnostic, "ServiceImport has no clusterset IP");
                report.record(self.local.name(), step, CheckOutcome::non_conformant(diagnostic));
                return report;
            }
        };

        let domain = service.clusterset_domain();
        let command = nslookup_command(&domain, None);

        for cluster in &self.clusters {
            let outcome = self
                .expect_output_containing(cluster, &command, &clusterset_ip)
                .await;
            let step = format!("resolve {domain} to {clusterset_ip}");
            if !self.record(&mut report, cluster, step, outcome) {
                break;
            }
        }

        report
    }

    /// An SRV query of `<service>.<ns>.svc.clusterset.local` returns exactly
    /// one record carrying the service port and the clusterset domain.
    #[instrument(skip_all, fields(check = "clusterset_srv_records"))]
    pub async fn check_clusterset_srv_records(&self) -> CheckReport {
        let mut report = CheckReport::new(CheckKind::ClustersetSrvRecords);
        let domain = self.config.service().clusterset_domain();
        let expected = vec![SrvRecord::new(self.config.service_port, domain.as_str())];

        for cluster in &self.clusters {
            let outcome = match self.expect_srv_records(cluster, &domain).await {
                Ok(records) if records == expected => CheckOutcome::Pass,
                Ok(records) => CheckOutcome::non_conformant(format!(
                    "Received SRV records {} do not match the expected records {}",
                    format_records(&records),
                    format_records(&expected)
                )),
                Err(diagnostic) => CheckOutcome::non_conformant(diagnostic),
            };
            let step = format!("SRV query of {domain}");
            if !self.record(&mut report, cluster, step, outcome) {
                break;
            }
        }

        report
    }

    /// `<service>.<ns>.svc.cluster.local` resolves to the local Service's
    /// cluster IP on the local cluster. No other cluster is queried.
    #[instrument(skip_all, fields(check = "local_service_resolution"))]
    pub async fn check_local_service_resolution(&self) -> CheckReport {
        let mut report = CheckReport::new(CheckKind::LocalServiceResolution);
        let service = self.config.service();
        let local = &self.local;

        info!(cluster = %local.name(), service = %service.name, "Retrieving local Service");

        let step = format!("retrieve Service {}/{}", service.namespace, service.name);
        let cluster_ip = match self.await_cluster_ip(local, &service).await {
            Ok(ip) => {
                info!(cluster_ip = %ip, "Found local Service cluster IP");
                report.record(local.name(), step, CheckOutcome::Pass);
                ip
            }
            Err(diagnostic) => {
                warn!(cluster = %local.name(), %diagnostic, "The service was not assigned a cluster IP");
                report.record(local.name(), step, CheckOutcome::non_conformant(diagnostic));
                return report;
            }
        };

        let domain = service.cluster_local_domain();
        let command = nslookup_command(&domain, None);
        let outcome = self
            .expect_output_containing(local, &command, &cluster_ip)
            .await;
        self.record(
            &mut report,
            local,
            format!("resolve {domain} to {cluster_ip}"),
            outcome,
        );

        report
    }

    /// Record an outcome; returns whether the check should go on to the next cluster.
    fn record(
        &self,
        report: &mut CheckReport,
        cluster: &ClusterEndpoint,
        step: String,
        outcome: CheckOutcome,
    ) -> bool {
        let passed = outcome.is_pass();
        if !passed {
            warn!(cluster = %cluster.name(), %step, "Non-conformant");
        }
        report.record(cluster.name(), step, outcome);
        passed || self.config.failure_policy == FailurePolicy::CollectAll
    }

    async fn await_clusterset_ip(
        &self,
        cluster: &ClusterEndpoint,
        service: &ServiceRef,
    ) -> Result<String, String> {
        let description = format!(
            "ServiceImport {}/{} on cluster {:?}",
            service.namespace,
            service.name,
            cluster.name()
        );

        let import = eventually(
            &self.config.poll,
            &description,
            || read_service_import(cluster, service),
            &HasAddress,
        )
        .await
        .map_err(|timeout| timeout.to_string())?;

        import
            .first_ip()
            .map(str::to_string)
            .ok_or_else(|| "ServiceImport does not contain an IP".to_string())
    }

    async fn await_cluster_ip(
        &self,
        cluster: &ClusterEndpoint,
        service: &ServiceRef,
    ) -> Result<String, String> {
        let description = format!(
            "Service {}/{} on cluster {:?}",
            service.namespace,
            service.name,
            cluster.name()
        );

        let record = eventually(
            &self.config.poll,
            &description,
            || read_service(cluster, service),
            &HasAddress,
        )
        .await
        .map_err(|timeout| timeout.to_string())?;

        record
            .assigned_ip()
            .map(str::to_string)
            .ok_or_else(|| "The service was not assigned a cluster IP".to_string())
    }

    async fn expect_output_containing(
        &self,
        cluster: &ClusterEndpoint,
        command: &[String],
        needle: &str,
    ) -> CheckOutcome {
        let joined = command.join(" ");
        info!(cluster = %cluster.name(), command = %joined, "Executing command");

        let description = format!("command {joined:?} on cluster {:?}", cluster.name());
        let result = eventually(
            &self.config.poll,
            &description,
            || self.exec_lookup(cluster, command),
            &ContainsSubstring(needle.to_string()),
        )
        .await;

        match result {
            Ok(_) => CheckOutcome::Pass,
            Err(timeout) => CheckOutcome::non_conformant(timeout.to_string()),
        }
    }

    async fn expect_srv_records(
        &self,
        cluster: &ClusterEndpoint,
        domain: &str,
    ) -> Result<Vec<SrvRecord>, String> {
        let command = nslookup_command(domain, Some("SRV"));
        let command = command.as_slice();
        let joined = command.join(" ");
        info!(cluster = %cluster.name(), command = %joined, "Executing command");

        let description = format!("command {joined:?} on cluster {:?}", cluster.name());
        eventually(
            &self.config.poll,
            &description,
            || self.run_srv_query(cluster, command),
            &NonEmpty,
        )
        .await
        .map_err(|timeout| timeout.to_string())
    }

    async fn exec_lookup(
        &self,
        cluster: &ClusterEndpoint,
        command: &[String],
    ) -> Observation<String> {
        cluster
            .executor()
            .exec(&self.config.request_pod(), command)
            .await
            .into()
    }

    async fn run_srv_query(
        &self,
        cluster: &ClusterEndpoint,
        command: &[String],
    ) -> Observation<Vec<SrvRecord>> {
        self.exec_lookup(cluster, command)
            .await
            .map(|stdout| parse_srv_records(&stdout))
    }
}

async fn read_service_import(
    cluster: &ClusterEndpoint,
    service: &ServiceRef,
) -> Observation<ServiceImportRecord> {
    cluster
        .api()
        .get_service_import(&service.namespace, &service.name)
        .await
        .into()
}

async fn read_service(cluster: &ClusterEndpoint, service: &ServiceRef) -> Observation<ServiceRecord> {
    cluster
        .api()
        .get_service(&service.namespace, &service.name)
        .await
        .into()
}

fn format_records(records: &[SrvRecord]) -> String {
    let items: Vec<String> = records.iter().map(SrvRecord::to_string).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_nslookup_command() {
        assert_eq!(
            nslookup_command("hello.ns.svc.clusterset.local", None),
            vec!["sh", "-c", "nslookup hello.ns.svc.clusterset.local"]
        );
        assert_eq!(
            nslookup_command("hello.ns.svc.clusterset.local", Some("SRV")),
            vec!["sh", "-c", "nslookup -type=SRV hello.ns.svc.clusterset.local"]
        );
    }

    #[test]
    fn test_driver_requires_clusters() {
        let config = SuiteConfig::new("ns");
        assert!(matches!(
            ConformanceDriver::new(&config, Vec::new()),
            Err(DriverError::NoClusters)
        ));
    }

    #[test]
    fn test_format_records() {
        let records = vec![SrvRecord::new(80, "a.example"), SrvRecord::new(81, "b.example")];
        assert_eq!(format_records(&records), "[a.example:80, b.example:81]");
        assert_eq!(format_records(&[]), "[]");
    }
}
