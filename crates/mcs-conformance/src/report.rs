//! Conformance outcomes and reports.
//!
//! Each check produces one [`CheckReport`]: the KEP-1645 clause it verifies
//! plus one [`ClusterOutcome`] per step that ran.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// KEP-1645 DNS section, the clause every check in this suite verifies.
pub const MCS_DNS_SPEC_REF: &str =
    "https://github.com/kubernetes/enhancements/tree/master/keps/sig-multicluster/1645-multi-cluster-services-api#dns";

/// The DNS checks of the suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    ClustersetIpResolution,
    ClustersetSrvRecords,
    LocalServiceResolution,
}

impl CheckKind {
    /// Every check, in run order.
    pub const ALL: [CheckKind; 3] = [
        CheckKind::ClustersetIpResolution,
        CheckKind::ClustersetSrvRecords,
        CheckKind::LocalServiceResolution,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            CheckKind::ClustersetIpResolution => {
                "A DNS lookup of the <service>.<ns>.svc.clusterset.local domain for a ClusterIP service should resolve to the clusterset IP"
            }
            CheckKind::ClustersetSrvRecords => {
                "A DNS SRV query of the <service>.<ns>.svc.clusterset.local domain for a ClusterIP service should return valid SRV records"
            }
            CheckKind::LocalServiceResolution => {
                "DNS lookups of the <service>.<ns>.svc.cluster.local domain for a ClusterIP service should only resolve local services"
            }
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// Terminal outcome of one step on one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    NonConformant { diagnostic: String },
}

impl CheckOutcome {
    pub fn non_conformant(diagnostic: impl Into<String>) -> Self {
        CheckOutcome::NonConformant {
            diagnostic: diagnostic.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, CheckOutcome::Pass)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterOutcome {
    pub cluster: String,
    /// What was being verified, e.g. `resolve hello.ns.svc.clusterset.local`.
    pub step: String,
    pub outcome: CheckOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub check: CheckKind,
    pub spec_ref: &'static str,
    pub outcomes: Vec<ClusterOutcome>,
}

/// A report with at least one non-conformant outcome.
#[derive(Debug, Error)]
#[error("Non-conformant: {check} ({spec_ref})\n{}", .failures.join("\n"))]
pub struct ReportError {
    pub check: CheckKind,
    pub spec_ref: &'static str,
    pub failures: Vec<String>,
}

impl CheckReport {
    pub fn new(check: CheckKind) -> Self {
        Self {
            check,
            spec_ref: MCS_DNS_SPEC_REF,
            outcomes: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        cluster: impl Into<String>,
        step: impl Into<String>,
        outcome: CheckOutcome,
    ) {
        self.outcomes.push(ClusterOutcome {
            cluster: cluster.into(),
            step: step.into(),
            outcome,
        });
    }

    /// True when every recorded step passed. A report with no outcomes is not
    /// conformant: nothing was verified.
    pub fn is_conformant(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.outcome.is_pass())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ClusterOutcome> {
        self.outcomes.iter().filter(|o| !o.outcome.is_pass())
    }

    /// Names of the clusters with at least one failing step, in order.
    pub fn failed_clusters(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for outcome in self.failures() {
            if !names.contains(&outcome.cluster.as_str()) {
                names.push(&outcome.cluster);
            }
        }
        names
    }

    pub fn into_result(self) -> Result<(), ReportError> {
        if self.is_conformant() {
            return Ok(());
        }

        let mut failures: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                CheckOutcome::NonConformant { diagnostic } => {
                    Some(format!("[{}] {}: {}", o.cluster, o.step, diagnostic))
                }
                CheckOutcome::Pass => None,
            })
            .collect();
        if failures.is_empty() {
            failures.push("no cluster was checked".to_string());
        }

        Err(ReportError {
            check: self.check,
            spec_ref: self.spec_ref,
            failures,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.check)?;
        writeln!(f, "  spec: {}", self.spec_ref)?;
        for o in &self.outcomes {
            match &o.outcome {
                CheckOutcome::Pass => writeln!(f, "  PASS [{}] {}", o.cluster, o.step)?,
                CheckOutcome::NonConformant { diagnostic } => {
                    writeln!(f, "  FAIL [{}] {}: {}", o.cluster, o.step, diagnostic)?
                }
            }
        }
        Ok(())
    }
}
