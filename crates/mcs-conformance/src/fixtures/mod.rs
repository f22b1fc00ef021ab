//! Member cluster backends and the objects the checks run against.

pub mod deploy;
pub mod fake;
pub mod kube_cluster;

pub use deploy::{ConformanceFixture, FixtureError};
pub use fake::{FakeCluster, FakeResponse};
pub use kube_cluster::KubeCluster;
