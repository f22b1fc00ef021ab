//! Live Conformance Tests: ClusterIP Service DNS
//!
//! Deploys the `hello` service to every member cluster, exports it from the
//! local (first) cluster, and runs each DNS check against the whole clusterset.
//! Tests run serially so their fixtures never overlap (they share one
//! namespace when `MCS_NAMESPACE` is set).

#![cfg(feature = "live")]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use mcs_conformance::config::SuiteConfig;
use mcs_conformance::driver::ConformanceDriver;
use mcs_conformance::fixtures::{ConformanceFixture, KubeCluster};
use mcs_conformance::report::CheckKind;
use serial_test::serial;

/// Deploy the fixture, run one check, and clean up before asserting.
async fn run_check(check: CheckKind) {
    let config = SuiteConfig::from_env().expect("Invalid MCS_* configuration");
    mcs_conformance::logging::init(&config.log_filter);

    let contexts = config
        .require_cluster_contexts()
        .expect("Set MCS_CLUSTER_CONTEXTS to the member cluster contexts");
    let clusters = KubeCluster::connect_all(contexts)
        .await
        .expect("Failed to build clients - check the kubeconfig contexts");

    let fixture = ConformanceFixture::new(&config);
    let deployed = fixture.deploy(&clusters).await;

    let report = match &deployed {
        Ok(()) => {
            let endpoints = clusters.iter().map(KubeCluster::endpoint).collect();
            let driver =
                ConformanceDriver::new(&config, endpoints).expect("At least one member cluster");
            Some(driver.run(check).await)
        }
        Err(_) => None,
    };

    if let Err(e) = fixture.cleanup(&clusters).await {
        eprintln!("Fixture cleanup failed: {e}");
    }

    deployed.expect("Fixture should deploy on every member cluster");
    if let Some(report) = report {
        println!("{report}");
        report
            .into_result()
            .unwrap_or_else(|e| panic!("Clusterset should be conformant: {e}"));
    }
}

#[tokio::test]
#[serial]
async fn test_clusterset_domain_resolves_to_clusterset_ip() {
    run_check(CheckKind::ClustersetIpResolution).await;
}

#[tokio::test]
#[serial]
async fn test_clusterset_srv_query_returns_service_record() {
    run_check(CheckKind::ClustersetSrvRecords).await;
}

#[tokio::test]
#[serial]
async fn test_cluster_local_domain_resolves_local_service() {
    run_check(CheckKind::LocalServiceResolution).await;
}
