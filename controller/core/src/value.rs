use crate::key::ReportKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Sections of a report body that are carried in the summary projection.
/// Everything else (per-finding arrays like `vulnerabilities`, `checks`,
/// `secrets`, `components`) is only available from the detail entry.
const SUMMARY_SECTIONS: &[&str] = &[
    "summary",
    "artifact",
    "scanner",
    "registry",
    "os",
    "updateTimestamp",
];

/// A value held by the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum CacheValue {
    Cluster(ClusterRecord),
    Namespace(NamespaceRecord),
    Report(ReportSummary),
    Detail(ReportDetail),
    /// A loosely typed value, e.g. written through the generic cache service.
    Json(Value),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRecord {
    pub name: String,
    #[serde(default)]
    pub api_server_url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceRecord {
    pub cluster: String,
    pub name: String,
}

/// Identifying metadata of a report object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Finding counts by severity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeverityCounts {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub unknown: u64,
}

/// The reduced, cheap-to-hold view of a report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub cluster: String,
    #[serde(default)]
    pub namespace: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub meta: ReportMeta,
    #[serde(default)]
    pub severity: SeverityCounts,
    /// The `summary`, `artifact`, `scanner`, ... sections of the report body.
    #[serde(default)]
    pub sections: Map<String, Value>,
}

/// The full report object, kept opaque until a caller asks for a section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDetail {
    pub cluster: String,
    #[serde(default)]
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub raw: Value,
}

// === impl CacheValue ===

impl CacheValue {
    /// Returns whether a value stored under a report key carries findings.
    ///
    /// Typed summaries use their severity counts; loosely typed values are
    /// inspected for severity counts wherever they may appear.
    pub fn has_vulnerabilities(&self) -> bool {
        match self {
            Self::Report(summary) => summary.has_vulnerabilities(),
            Self::Json(value) => SeverityCounts::from_value(value).any(),
            Self::Detail(detail) => SeverityCounts::from_value(&detail.raw).any(),
            Self::Cluster(_) | Self::Namespace(_) => false,
        }
    }

    pub fn as_report(&self) -> Option<&ReportSummary> {
        match self {
            Self::Report(summary) => Some(summary),
            _ => None,
        }
    }

    pub fn as_detail(&self) -> Option<&ReportDetail> {
        match self {
            Self::Detail(detail) => Some(detail),
            _ => None,
        }
    }

    /// Extracts a namespace name from either a typed record or a loosely
    /// typed object (`{"name": ..}` or `{"metadata": {"name": ..}}`).
    pub fn namespace_name(&self) -> Option<&str> {
        match self {
            Self::Namespace(ns) => Some(&ns.name),
            Self::Json(Value::String(name)) => Some(name),
            Self::Json(value) => value
                .get("name")
                .or_else(|| value.get("metadata").and_then(|m| m.get("name")))
                .and_then(Value::as_str),
            _ => None,
        }
    }
}

// === impl SeverityCounts ===

impl SeverityCounts {
    /// Reads severity counts from a report-shaped JSON value.
    ///
    /// Looks in `report.summary`, `status.summary`, `summary`, then the value
    /// itself, accepting both `criticalCount` and `critical` spellings. The
    /// first location holding any count wins.
    pub fn from_value(value: &Value) -> Self {
        let candidates = [
            value.get("report").and_then(|r| r.get("summary")),
            value.get("status").and_then(|r| r.get("summary")),
            value.get("summary"),
            Some(value),
        ];
        candidates
            .into_iter()
            .flatten()
            .filter_map(Self::from_summary)
            .next()
            .unwrap_or_default()
    }

    /// Reads counts from a summary object, returning `None` when the object
    /// holds no recognized count at all.
    fn from_summary(summary: &Value) -> Option<Self> {
        let summary = summary.as_object()?;
        let count = |name: &str| {
            summary
                .get(&format!("{name}Count"))
                .or_else(|| summary.get(name))
                .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
        };
        let counts = [
            count("critical"),
            count("high"),
            count("medium"),
            count("low"),
            count("unknown"),
        ];
        if counts.iter().all(Option::is_none) {
            return None;
        }
        let [critical, high, medium, low, unknown] = counts.map(Option::unwrap_or_default);
        Some(Self {
            critical,
            high,
            medium,
            low,
            unknown,
        })
    }

    pub fn total(&self) -> u64 {
        self.critical + self.high + self.medium + self.low + self.unknown
    }

    pub fn any(&self) -> bool {
        self.total() > 0
    }
}

// === impl ReportSummary ===

impl ReportSummary {
    /// Projects a report body into a summary.
    ///
    /// `body` is the object without its type and metadata fields, i.e.
    /// `{"report": {...}}` for most report kinds or `{"spec": .., "status":
    /// ..}` for compliance reports.
    pub fn project(key: &ReportKey, meta: ReportMeta, body: &Value) -> Self {
        let section_root = body
            .get("report")
            .or_else(|| body.get("status"))
            .and_then(Value::as_object);
        let sections = section_root
            .map(|root| {
                SUMMARY_SECTIONS
                    .iter()
                    .filter_map(|name| root.get(*name).map(|v| (name.to_string(), v.clone())))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            cluster: key.cluster.clone(),
            namespace: key.namespace.clone(),
            kind: key.kind.clone(),
            name: key.name.clone(),
            meta,
            severity: SeverityCounts::from_value(body),
            sections,
        }
    }

    pub fn key(&self) -> ReportKey {
        ReportKey::new(&self.cluster, &self.namespace, &self.kind, &self.name)
    }

    pub fn has_vulnerabilities(&self) -> bool {
        self.severity.any()
    }
}

// === impl ReportDetail ===

impl ReportDetail {
    pub fn new(key: &ReportKey, raw: Value) -> Self {
        Self {
            cluster: key.cluster.clone(),
            namespace: key.namespace.clone(),
            kind: key.kind.clone(),
            name: key.name.clone(),
            raw,
        }
    }

    pub fn key(&self) -> ReportKey {
        ReportKey::new(&self.cluster, &self.namespace, &self.kind, &self.name)
    }

    /// Returns a section of the report body, e.g. `vulnerabilities`.
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.raw
            .get("report")
            .or_else(|| self.raw.get("status"))
            .and_then(|root| root.get(name))
    }

    /// Deserializes a section of the report body on demand.
    pub fn parse_section<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> Option<serde_json::Result<T>> {
        self.section(name).map(|v| T::deserialize(v))
    }
}
