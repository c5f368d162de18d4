use kube::discovery::ApiResource;
use report_cache_controller_core::kinds::{default_kinds, ReportKind, REPORT_API_VERSION};
use tracing::{debug, warn};

pub fn api_resource(kind: &ReportKind) -> ApiResource {
    ApiResource {
        group: kind.group().to_string(),
        version: kind.version().to_string(),
        api_version: kind.api_version.clone(),
        kind: kind.kind.clone(),
        plural: kind.name.clone(),
    }
}

/// Lists the report resources served by the cluster.
///
/// Falls back to the default kinds when the group cannot be listed, e.g.
/// because discovery is forbidden or the operator's CRDs are not yet
/// installed.
pub async fn discover(client: &kube::Client) -> Vec<ReportKind> {
    let resources = match client.list_api_group_resources(REPORT_API_VERSION).await {
        Ok(resources) => resources,
        Err(error) => {
            warn!(%error, "Failed to discover report kinds; using defaults");
            return default_kinds();
        }
    };

    let kinds = from_resource_list(&resources.group_version, resources.resources);
    if kinds.is_empty() {
        warn!(group = %resources.group_version, "No report kinds served; using defaults");
        return default_kinds();
    }
    debug!(kinds = kinds.len(), "Discovered report kinds");
    kinds
}

fn from_resource_list(
    group_version: &str,
    resources: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource>,
) -> Vec<ReportKind> {
    let mut kinds = resources
        .into_iter()
        // Subresources, e.g. `vulnerabilityreports/status`.
        .filter(|r| !r.name.contains('/') && r.name.ends_with("reports"))
        .map(|r| ReportKind {
            name: r.name,
            namespaced: r.namespaced,
            api_version: group_version.to_string(),
            kind: r.kind,
        })
        .collect::<Vec<_>>();
    kinds.sort_by(|a, b| a.name.cmp(&b.name));
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;

    fn resource(name: &str, kind: &str, namespaced: bool) -> APIResource {
        APIResource {
            name: name.to_string(),
            kind: kind.to_string(),
            namespaced,
            ..Default::default()
        }
    }

    #[test]
    fn resource_list_skips_subresources() {
        let kinds = from_resource_list(
            REPORT_API_VERSION,
            vec![
                resource("vulnerabilityreports", "VulnerabilityReport", true),
                resource("vulnerabilityreports/status", "VulnerabilityReport", true),
                resource("clusterrbacassessmentreports", "ClusterRbacAssessmentReport", false),
            ],
        );
        assert_eq!(
            kinds,
            vec![
                ReportKind::new(
                    "clusterrbacassessmentreports",
                    false,
                    "ClusterRbacAssessmentReport"
                ),
                ReportKind::new("vulnerabilityreports", true, "VulnerabilityReport"),
            ]
        );
    }

    #[test]
    fn api_resource_uses_plural_name() {
        let ar = api_resource(&ReportKind::new(
            "vulnerabilityreports",
            true,
            "VulnerabilityReport",
        ));
        assert_eq!(ar.group, "aquasecurity.github.io");
        assert_eq!(ar.version, "v1alpha1");
        assert_eq!(ar.plural, "vulnerabilityreports");
        assert_eq!(ar.kind, "VulnerabilityReport");
    }
}
