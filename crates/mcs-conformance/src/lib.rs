//! Multi-Cluster Services DNS Conformance Suite
//!
//! This crate verifies that a set of member clusters implements the DNS part of
//! the Kubernetes Multi-Cluster Services API for ClusterIP services: clusterset
//! IP resolution, clusterset SRV records, and local-only `cluster.local`
//! resolution.
//!
//! # Features
//!
//! - `live`: Run the checks against real clusters (deploys a fixture namespace)
//!
//! Without `live`, only the in-memory scenarios run; they drive the same checks
//! through [`fixtures::FakeCluster`].
//!
//! # Prerequisites
//!
//! 1. Two or more clusters joined into a clusterset, with an MCS controller and
//!    clusterset DNS installed
//! 2. A kubeconfig with one context per member cluster
//! 3. `MCS_CLUSTER_CONTEXTS` set to those contexts, local cluster first
//!
//! # Usage
//!
//! ```bash
//! # In-memory scenarios only
//! cargo test -p mcs-conformance
//!
//! # Live run
//! MCS_CLUSTER_CONTEXTS=kind-c1,kind-c2 cargo test -p mcs-conformance --features live
//! ```

pub mod cluster;
pub mod config;
pub mod driver;
pub mod eventual;
pub mod fixtures;
pub mod logging;
pub mod report;
pub mod srv;
