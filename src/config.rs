//! Typed cluster topology and tuning configuration.
//!
//! This module does not read YAML or any other on-disk format; an external loader is
//! expected to deserialize into [`GatewayConfig`] (it derives `serde::Deserialize`)
//! and then call [`GatewayConfig::validate`] before handing it to the rest of the crate.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::net::Host;

/// Default network-connect timeout for LDAP sessions.
pub const DEFAULT_NET_TIMEOUT: Duration = Duration::from_secs(30);
/// Default per-operation timeout for LDAP requests.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);
/// Default credential cache TTL.
pub const DEFAULT_PASSWORD_TTL: Duration = Duration::from_secs(3600);
/// Default pooled-session idle TTL.
pub const DEFAULT_POOL_IDLE_TTL: Duration = Duration::from_secs(300);
/// Default short TCP-reachability probe timeout used by the node selector.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cluster name '{0}' is declared more than once")]
    DuplicateClusterName(String),
    #[error("cluster '{0}' must set exactly one of `host` or `nodes`")]
    AmbiguousNodes(String),
    #[error("cluster '{0}' has no nodes")]
    EmptyNodes(String),
    #[error("cluster '{0}' has an invalid port {1}")]
    InvalidPort(String, u32),
    #[error("cluster '{0}' has an empty base_dn")]
    EmptyBaseDn(String),
    #[error("cluster '{0}' column field '{1}' is a select without options")]
    SelectWithoutOptions(String, String),
    #[error("cluster '{0}' column field '{1}' has options but is not a select")]
    OptionsOnNonSelect(String, String),
}

/// A single directory view exposed by the directory service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    Users,
    Groups,
    Ous,
    All,
}

impl View {
    /// Canonical base filter for this view, per the directory service contract.
    #[must_use]
    pub const fn base_filter(self) -> &'static str {
        match self {
            Self::Users => {
                "(|(objectClass=inetOrgPerson)(objectClass=posixAccount)(objectClass=account))"
            }
            Self::Groups => {
                "(|(objectClass=groupOfNames)(objectClass=groupOfUniqueNames)(objectClass=posixGroup))"
            }
            Self::Ous => "(objectClass=organizationalUnit)",
            Self::All => "(objectClass=*)",
        }
    }
}

/// Declarative form field type recognized by the (external) form-generation facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FieldType {
    Text,
    Email,
    Password,
    Number,
    Select { options: Vec<String> },
    Checkbox,
}

/// A single column/field descriptor shown in the declarative UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub label: String,
    #[serde(flatten)]
    pub field: FieldType,
}

/// Password policy for a cluster's credential prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_confirmation: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_confirmation: true,
        }
    }
}

/// A placeholder value resolved by the LDAP gateway at entry-creation time (§4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderValue {
    Literal(String),
    NextUid,
    DaysSinceEpoch,
    Field(String),
}

/// Declarative template used to synthesize a new entry's object classes, DN, and
/// attributes from caller-supplied values plus server-/clock-derived placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationTemplate {
    pub object_classes: Vec<String>,
    pub dn_pattern: String,
    pub attributes: HashMap<String, PlaceholderValue>,
}

/// A single directory node's coordinates and declared position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub host: String,
    pub port: u16,
    pub label: Option<String>,
}

impl NodeSpec {
    #[must_use]
    pub fn address(&self) -> Host {
        Host::new(self.host.clone(), self.port)
    }
}

/// Per-cluster configuration as validated by [`GatewayConfig::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    /// Single-node shorthand. Exactly one of `host`/`nodes` must be set.
    pub host: Option<NodeSpec>,
    /// Multi-master node list, index 0 is the write target.
    pub nodes: Option<Vec<NodeSpec>>,
    pub bind_dn: String,
    pub base_dn: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub password_policy: PasswordPolicy,
    pub user_template: CreationTemplate,
    #[serde(default)]
    pub columns: HashMap<View, Vec<ColumnDescriptor>>,
}

impl ClusterConfig {
    /// Returns the ordered node list regardless of whether `host` or `nodes` was set.
    #[must_use]
    pub fn node_list(&self) -> Vec<NodeSpec> {
        match (&self.host, &self.nodes) {
            (Some(single), None) => vec![single.clone()],
            (None, Some(many)) => many.clone(),
            _ => Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match (&self.host, &self.nodes) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => return Err(ConfigError::AmbiguousNodes(self.name.clone())),
        }
        let nodes = self.node_list();
        if nodes.is_empty() {
            return Err(ConfigError::EmptyNodes(self.name.clone()));
        }
        for node in &nodes {
            if node.port == 0 {
                return Err(ConfigError::InvalidPort(self.name.clone(), u32::from(node.port)));
            }
        }
        if self.base_dn.is_empty() {
            return Err(ConfigError::EmptyBaseDn(self.name.clone()));
        }
        for columns in self.columns.values() {
            for col in columns {
                match &col.field {
                    FieldType::Select { options } if options.is_empty() => {
                        return Err(ConfigError::SelectWithoutOptions(
                            self.name.clone(),
                            col.name.clone(),
                        ));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Top-level validated configuration the core consumes (§4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub clusters: Vec<ClusterConfig>,
}

impl GatewayConfig {
    /// Validates cross-cluster and per-cluster invariants. The (external) YAML loader
    /// must call this and fail process startup on error; embedders that bypass the
    /// loader get the same guarantee by calling it themselves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if !seen.insert(cluster.name.clone()) {
                return Err(ConfigError::DuplicateClusterName(cluster.name.clone()));
            }
            cluster.validate()?;
        }
        Ok(())
    }

    #[must_use]
    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// Runtime tuning knobs read directly from the environment (§6); not topology.
#[derive(Debug, Clone)]
pub struct RuntimeTuning {
    pub net_timeout: Duration,
    pub op_timeout: Duration,
    pub password_ttl: Duration,
    pub pool_idle_ttl: Duration,
}

impl Default for RuntimeTuning {
    fn default() -> Self {
        Self {
            net_timeout: DEFAULT_NET_TIMEOUT,
            op_timeout: DEFAULT_OP_TIMEOUT,
            password_ttl: DEFAULT_PASSWORD_TTL,
            pool_idle_ttl: DEFAULT_POOL_IDLE_TTL,
        }
    }
}

impl RuntimeTuning {
    /// Reads overrides from the environment, falling back to the documented defaults
    /// for any key that is absent or fails to parse.
    #[must_use]
    pub fn from_env() -> Self {
        let mut tuning = Self::default();
        if let Some(v) = env_secs("LDAP_NET_TIMEOUT_S") {
            tuning.net_timeout = v;
        }
        if let Some(v) = env_secs("LDAP_OP_TIMEOUT_S") {
            tuning.op_timeout = v;
        }
        if let Some(v) = env_secs("PASSWORD_CACHE_TTL_S") {
            tuning.password_ttl = v;
        }
        if let Some(v) = env_secs("POOL_IDLE_TTL_S") {
            tuning.pool_idle_ttl = v;
        }
        tuning
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::{ClusterConfig, CreationTemplate, GatewayConfig, NodeSpec};
    use std::collections::HashMap;

    fn cluster(name: &str, nodes: Vec<NodeSpec>) -> ClusterConfig {
        ClusterConfig {
            name: name.into(),
            host: None,
            nodes: Some(nodes),
            bind_dn: "cn=admin,dc=x".into(),
            base_dn: "dc=x".into(),
            readonly: false,
            password_policy: super::PasswordPolicy::default(),
            user_template: CreationTemplate {
                object_classes: vec!["inetOrgPerson".into()],
                dn_pattern: "uid=${uid},ou=people,dc=x".into(),
                attributes: HashMap::new(),
            },
            columns: HashMap::new(),
        }
    }

    #[test]
    fn rejects_duplicate_cluster_names() {
        let n = vec![NodeSpec { host: "a".into(), port: 389, label: None }];
        let cfg = GatewayConfig {
            clusters: vec![cluster("c1", n.clone()), cluster("c1", n)],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_base_dn() {
        let mut c = cluster("c1", vec![NodeSpec { host: "a".into(), port: 389, label: None }]);
        c.base_dn.clear();
        let cfg = GatewayConfig { clusters: vec![c] };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_cluster() {
        let cfg = GatewayConfig {
            clusters: vec![cluster(
                "c1",
                vec![
                    NodeSpec { host: "a".into(), port: 389, label: Some("master".into()) },
                    NodeSpec { host: "b".into(), port: 389, label: Some("replica".into()) },
                ],
            )],
        };
        assert!(cfg.validate().is_ok());
    }
}
