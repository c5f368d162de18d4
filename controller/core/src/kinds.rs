use serde::{Deserialize, Serialize};

pub const REPORT_API_GROUP: &str = "aquasecurity.github.io";
pub const REPORT_API_VERSION: &str = "aquasecurity.github.io/v1alpha1";

/// A discovered report resource type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportKind {
    /// The plural resource name, e.g. `vulnerabilityreports`. Used in cache
    /// keys.
    pub name: String,
    pub namespaced: bool,
    /// `<group>/<version>`.
    pub api_version: String,
    /// The object kind, e.g. `VulnerabilityReport`.
    pub kind: String,
}

impl ReportKind {
    pub fn new(name: &str, namespaced: bool, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            namespaced,
            api_version: REPORT_API_VERSION.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn group(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(group, _)| group)
            .unwrap_or_default()
    }

    pub fn version(&self) -> &str {
        self.api_version
            .split_once('/')
            .map(|(_, version)| version)
            .unwrap_or(&self.api_version)
    }
}

/// The report kinds produced by the scanner operator.
pub fn default_kinds() -> Vec<ReportKind> {
    vec![
        ReportKind::new("vulnerabilityreports", true, "VulnerabilityReport"),
        ReportKind::new("configauditreports", true, "ConfigAuditReport"),
        ReportKind::new("exposedsecretreports", true, "ExposedSecretReport"),
        ReportKind::new("rbacassessmentreports", true, "RbacAssessmentReport"),
        ReportKind::new("infraassessmentreports", true, "InfraAssessmentReport"),
        ReportKind::new("sbomreports", true, "SbomReport"),
        ReportKind::new(
            "clustervulnerabilityreports",
            false,
            "ClusterVulnerabilityReport",
        ),
        ReportKind::new("clusterconfigauditreports", false, "ClusterConfigAuditReport"),
        ReportKind::new(
            "clusterrbacassessmentreports",
            false,
            "ClusterRbacAssessmentReport",
        ),
        ReportKind::new(
            "clusterinfraassessmentreports",
            false,
            "ClusterInfraAssessmentReport",
        ),
        ReportKind::new("clustersbomreports", false, "ClusterSbomReport"),
        ReportKind::new("clustercompliancereports", false, "ClusterComplianceReport"),
    ]
}
