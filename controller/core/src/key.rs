use std::{fmt, str::FromStr};

const CLUSTER_PREFIX: &str = "cluster";
const NAMESPACE_PREFIX: &str = "namespace";
const REPORT_PREFIX: &str = "report";
const DETAIL_PREFIX: &str = "detail";

/// Identifies a single report object in a single cluster.
///
/// `namespace` is empty for cluster-scoped report kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportKey {
    pub cluster: String,
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

/// The structured form of a cache key string.
///
/// ```text
/// cluster:<cluster>
/// namespace:<cluster>:<namespace>
/// report:<cluster>:<namespace>:<kind>:<name>
/// detail:<cluster>:<namespace>:<kind>:<name>
/// ```
///
/// Keys that do not match the grammar are carried verbatim as `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Cluster(String),
    Namespace { cluster: String, namespace: String },
    Report(ReportKey),
    Detail(ReportKey),
    Other(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("cache key {0:?} is missing a component")]
    MissingComponent(String),

    #[error("cache key {0:?} has an empty {1}")]
    Empty(String, &'static str),
}

// === impl ReportKey ===

impl ReportKey {
    pub fn new(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    pub fn report_key(&self) -> String {
        format!(
            "{REPORT_PREFIX}:{}:{}:{}:{}",
            self.cluster, self.namespace, self.kind, self.name
        )
    }

    pub fn detail_key(&self) -> String {
        format!(
            "{DETAIL_PREFIX}:{}:{}:{}:{}",
            self.cluster, self.namespace, self.kind, self.name
        )
    }

    /// Parses the `<cluster>:<namespace>:<kind>:<name>` tail of a report or
    /// detail key. The name absorbs any remaining colons.
    fn parse_tail(key: &str, tail: &str) -> Result<Self, KeyError> {
        let mut parts = tail.splitn(4, ':');
        let mut next = || {
            parts
                .next()
                .ok_or_else(|| KeyError::MissingComponent(key.to_string()))
        };
        let cluster = next()?;
        let namespace = next()?;
        let kind = next()?;
        let name = next()?;
        if cluster.is_empty() {
            return Err(KeyError::Empty(key.to_string(), "cluster"));
        }
        if kind.is_empty() {
            return Err(KeyError::Empty(key.to_string(), "kind"));
        }
        if name.is_empty() {
            return Err(KeyError::Empty(key.to_string(), "name"));
        }
        Ok(Self::new(cluster, namespace, kind, name))
    }
}

impl fmt::Display for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}/{}", self.cluster, self.kind, self.name)
        } else {
            write!(
                f,
                "{}/{}/{}/{}",
                self.cluster, self.namespace, self.kind, self.name
            )
        }
    }
}

// === impl CacheKey ===

impl CacheKey {
    pub fn cluster(cluster: impl Into<String>) -> Self {
        Self::Cluster(cluster.into())
    }

    pub fn namespace(cluster: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self::Namespace {
            cluster: cluster.into(),
            namespace: namespace.into(),
        }
    }

    /// Parses a key string, falling back to `Other` for keys outside the
    /// grammar. Malformed keys with a known prefix are also kept as `Other`,
    /// and expire like opaque keys. Use `str::parse` to reject them instead,
    /// as writes through the cache service do.
    pub fn parse(key: &str) -> Self {
        Self::from_str(key).unwrap_or_else(|_| Self::Other(key.to_string()))
    }

    /// Report and detail entries are the last-known-good view of a cluster and
    /// are never aged out passively.
    pub fn is_report_like(&self) -> bool {
        matches!(self, Self::Report(_) | Self::Detail(_))
    }

    pub fn report(&self) -> Option<&ReportKey> {
        match self {
            Self::Report(key) => Some(key),
            _ => None,
        }
    }

    pub fn cluster_name(&self) -> Option<&str> {
        match self {
            Self::Cluster(cluster) | Self::Namespace { cluster, .. } => Some(cluster),
            Self::Report(key) | Self::Detail(key) => Some(&key.cluster),
            Self::Other(_) => None,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Cluster(_) => CLUSTER_PREFIX,
            Self::Namespace { .. } => NAMESPACE_PREFIX,
            Self::Report(_) => REPORT_PREFIX,
            Self::Detail(_) => DETAIL_PREFIX,
            Self::Other(_) => "other",
        }
    }
}

impl FromStr for CacheKey {
    type Err = KeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let Some((prefix, tail)) = key.split_once(':') else {
            return Ok(Self::Other(key.to_string()));
        };
        match prefix {
            CLUSTER_PREFIX => {
                if tail.is_empty() {
                    return Err(KeyError::Empty(key.to_string(), "cluster"));
                }
                Ok(Self::Cluster(tail.to_string()))
            }
            NAMESPACE_PREFIX => {
                let (cluster, namespace) = tail
                    .split_once(':')
                    .ok_or_else(|| KeyError::MissingComponent(key.to_string()))?;
                if cluster.is_empty() {
                    return Err(KeyError::Empty(key.to_string(), "cluster"));
                }
                if namespace.is_empty() {
                    return Err(KeyError::Empty(key.to_string(), "namespace"));
                }
                Ok(Self::namespace(cluster, namespace))
            }
            REPORT_PREFIX => ReportKey::parse_tail(key, tail).map(Self::Report),
            DETAIL_PREFIX => ReportKey::parse_tail(key, tail).map(Self::Detail),
            _ => Ok(Self::Other(key.to_string())),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster(cluster) => write!(f, "{CLUSTER_PREFIX}:{cluster}"),
            Self::Namespace { cluster, namespace } => {
                write!(f, "{NAMESPACE_PREFIX}:{cluster}:{namespace}")
            }
            Self::Report(key) => f.write_str(&key.report_key()),
            Self::Detail(key) => f.write_str(&key.detail_key()),
            Self::Other(key) => f.write_str(key),
        }
    }
}

/// Returns the prefix matching every `namespace:` key of a cluster.
pub fn namespace_prefix(cluster: &str) -> String {
    format!("{NAMESPACE_PREFIX}:{cluster}:")
}
