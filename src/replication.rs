//! Cross-node replication visibility: `contextCSN` snapshots and a live
//! write/read/delete probe (§4.6).
//!
//! Both operations bypass the session pool entirely and open short-lived,
//! dedicated connections via [`crate::net::Session::open`], since they address
//! every configured node rather than whichever one the selector would route a
//! normal operation to, and fan-out traffic here must not compete with request
//! handlers for pooled capacity.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ldap3::{Scope, SearchEntry};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    config::ClusterConfig,
    errors::{Error, Result},
    gateway::{GatewayError, MutationOutcome},
    net::{Fingerprint, Host, PasswordProvider, Session},
};

/// How long the probe waits between writing on node 0 and reading on the rest,
/// giving asynchronous replication a chance to propagate the change.
pub const DEFAULT_PROPAGATION_WINDOW: Duration = Duration::from_secs(5);

/// One node's replication snapshot.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub label: String,
    pub host: String,
    pub context_csn: Option<String>,
    pub sync_age_s: Option<i64>,
    pub reachable: bool,
}

/// Outcome of a write/read/delete replication probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    pub latency_ms: u128,
    pub message: String,
}

/// Computes `contextCSN`-based snapshots and runs end-to-end replication probes
/// for a single cluster, entirely outside the session pool.
pub struct ReplicationMonitor {
    net_timeout: Duration,
    op_timeout: Duration,
}

impl ReplicationMonitor {
    #[must_use]
    pub fn new(net_timeout: Duration, op_timeout: Duration) -> Self {
        Self {
            net_timeout,
            op_timeout,
        }
    }

    async fn open(
        &self,
        fingerprint: Fingerprint,
        node: &Host,
        passwords: &dyn PasswordProvider,
    ) -> Result<Session, Error> {
        let password = passwords.password_for(&fingerprint.cluster).await?;
        Session::open(fingerprint, node, &password, self.net_timeout)
            .await
            .map_err(|e| match &e {
                crate::net::NetError::Bind(msg) => Error::AuthFailed(msg.clone()),
                crate::net::NetError::Timeout => Error::Timeout(e.to_string()),
                crate::net::NetError::Connect(msg) => Error::ServiceUnavailable(msg.clone()),
            })
    }

    async fn read_entry_unpooled(
        &self,
        session: &mut Session,
        dn: &str,
        attributes: Vec<String>,
    ) -> Result<Option<SearchEntry>, Error> {
        let result = tokio::time::timeout(
            self.op_timeout,
            session.ldap().search(dn, Scope::Base, "(objectClass=*)", attributes),
        )
        .await;
        match result {
            Ok(Ok(search)) => match search.success() {
                Ok((entries, _)) => Ok(entries.into_iter().next().map(SearchEntry::construct)),
                Err(_) => Ok(None),
            },
            Ok(Err(e)) => Err(Error::Gateway(GatewayError::Search(e.to_string()))),
            Err(_) => Err(Error::Timeout(format!("read_entry({dn})"))),
        }
    }

    async fn add_unpooled(
        &self,
        session: &mut Session,
        dn: &str,
        attributes: Vec<(String, std::collections::HashSet<String>)>,
    ) -> Result<MutationOutcome, Error> {
        let attrs: Vec<(&str, std::collections::HashSet<&str>)> = attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.iter().map(String::as_str).collect()))
            .collect();
        let result = tokio::time::timeout(self.op_timeout, session.ldap().add(dn, attrs)).await;
        Self::finish_mutation_unpooled(dn, "add", result)
    }

    async fn delete_unpooled(&self, session: &mut Session, dn: &str) -> Result<MutationOutcome, Error> {
        let result = tokio::time::timeout(self.op_timeout, session.ldap().delete(dn)).await;
        Self::finish_mutation_unpooled(dn, "delete", result)
    }

    fn finish_mutation_unpooled(
        dn: &str,
        operation: &str,
        result: std::result::Result<
            ldap3::result::Result<ldap3::LdapResult>,
            tokio::time::error::Elapsed,
        >,
    ) -> Result<MutationOutcome, Error> {
        match result {
            Ok(Ok(res)) => match res.success() {
                Ok(_) => {
                    info!(dn, operation, outcome = "committed");
                    Ok(MutationOutcome::Committed)
                }
                Err(e) => {
                    warn!(dn, operation, outcome = "rejected", error = %e);
                    Ok(MutationOutcome::Rejected)
                }
            },
            Ok(Err(e)) => {
                warn!(dn, operation, outcome = "rejected", error = %e);
                Ok(MutationOutcome::Rejected)
            }
            Err(_) => {
                warn!(dn, operation, outcome = "timed_out");
                Ok(MutationOutcome::TimedOut)
            }
        }
    }

    /// Reads `contextCSN` from the root DSE of every configured node. Nodes that
    /// are unreachable, or whose root DSE carries no `contextCSN` at all, get a
    /// `None` entry and are excluded from the in-sync comparison below.
    pub async fn snapshot(
        &self,
        cluster: &ClusterConfig,
        passwords: &dyn PasswordProvider,
    ) -> Vec<NodeSnapshot> {
        let mut snapshots = Vec::new();
        for node in cluster.node_list() {
            let host = node.address();
            let fingerprint = Fingerprint::new(&cluster.name, &host, &cluster.bind_dn);
            let label = node.label.clone().unwrap_or_else(|| host.to_string());

            let result = async {
                let mut session = self.open(fingerprint, &host, passwords).await?;
                self.read_entry_unpooled(
                    &mut session,
                    "",
                    vec!["contextCSN".to_string(), "namingContexts".to_string()],
                )
                .await?
                .ok_or_else(|| Error::NotFound("root DSE".into()))
            }
            .await;

            match result {
                Ok(entry) => {
                    let context_csn = entry
                        .attrs
                        .get("contextCSN")
                        .and_then(|v| v.first())
                        .cloned();
                    let sync_age_s = context_csn.as_deref().and_then(parse_csn_age_seconds);
                    snapshots.push(NodeSnapshot {
                        label,
                        host: host.to_string(),
                        context_csn,
                        sync_age_s,
                        reachable: true,
                    });
                }
                Err(e) => {
                    warn!(cluster = %cluster.name, node = %host, error = %e, "root DSE read failed");
                    snapshots.push(NodeSnapshot {
                        label,
                        host: host.to_string(),
                        context_csn: None,
                        sync_age_s: None,
                        reachable: false,
                    });
                }
            }
        }
        snapshots
    }

    /// Whether every node that reported a `contextCSN` agrees with the rest. Nodes
    /// missing a `contextCSN` (unreachable, or a server that doesn't expose it) are
    /// excluded from the comparison; a comparison set with fewer than two members
    /// is vacuously in sync.
    #[must_use]
    pub fn in_sync(snapshots: &[NodeSnapshot]) -> bool {
        let mut comparable = snapshots
            .iter()
            .filter_map(|s| s.context_csn.as_deref())
            .filter_map(parse_csn_timestamp);
        let Some(first) = comparable.next() else {
            return true;
        };
        comparable.all(|ts| (ts - first).num_seconds().abs() <= CSN_SYNC_TOLERANCE_SECS)
    }

    /// Creates a throwaway entry on node 0, waits for `DEFAULT_PROPAGATION_WINDOW`,
    /// then attempts to read it back on every other node, and finally deletes it on
    /// node 0 (best-effort, retried once on failure).
    pub async fn probe(
        &self,
        cluster: &ClusterConfig,
        passwords: &dyn PasswordProvider,
    ) -> Result<ProbeResult, Error> {
        let nodes = cluster.node_list();
        let Some(writer) = nodes.first() else {
            return Err(Error::ServiceUnavailable(format!(
                "cluster '{}' has no configured nodes",
                cluster.name
            )));
        };
        let writer_host = writer.address();
        let writer_fp = Fingerprint::new(&cluster.name, &writer_host, &cluster.bind_dn);

        let probe_rdn = format!("cn=replication-probe-{}", uuid::Uuid::new_v4());
        let probe_dn = format!("{probe_rdn},{}", cluster.base_dn);
        let started = Instant::now();

        let mut writer_session = match self.open(writer_fp, &writer_host, passwords).await {
            Ok(session) => session,
            Err(e) => {
                return Ok(ProbeResult {
                    success: false,
                    latency_ms: started.elapsed().as_millis(),
                    message: format!("connecting to write node failed: {e}"),
                });
            }
        };

        let create = self
            .add_unpooled(
                &mut writer_session,
                &probe_dn,
                vec![
                    (
                        "objectClass".to_string(),
                        std::collections::HashSet::from(["extensibleObject".to_string()]),
                    ),
                    (
                        "cn".to_string(),
                        std::collections::HashSet::from([probe_rdn["cn=".len()..].to_string()]),
                    ),
                ],
            )
            .await;
        if let Err(e) = create {
            return Ok(ProbeResult {
                success: false,
                latency_ms: started.elapsed().as_millis(),
                message: format!("create on write node failed: {e}"),
            });
        }

        sleep(DEFAULT_PROPAGATION_WINDOW).await;

        let mut unread_on = Vec::new();
        for node in nodes.iter().skip(1) {
            let host = node.address();
            let fingerprint = Fingerprint::new(&cluster.name, &host, &cluster.bind_dn);
            let read = async {
                let mut session = self.open(fingerprint, &host, passwords).await?;
                self.read_entry_unpooled(&mut session, &probe_dn, vec!["cn".to_string()])
                    .await
            }
            .await;
            match read {
                Ok(Some(_)) => {}
                Ok(None) => unread_on.push(node.label.clone().unwrap_or_else(|| host.to_string())),
                Err(e) => {
                    warn!(cluster = %cluster.name, node = %host, error = %e, "probe read failed");
                    unread_on.push(node.label.clone().unwrap_or_else(|| host.to_string()));
                }
            }
        }

        let delete_result = self.delete_unpooled(&mut writer_session, &probe_dn).await;
        if delete_result.is_err() {
            warn!(cluster = %cluster.name, dn = %probe_dn, "probe cleanup failed, retrying once");
            let _ = self.delete_unpooled(&mut writer_session, &probe_dn).await;
        }
        writer_session.close().await;

        let latency_ms = started.elapsed().as_millis();
        if unread_on.is_empty() {
            info!(cluster = %cluster.name, latency_ms, "replication probe succeeded");
            Ok(ProbeResult {
                success: true,
                latency_ms,
                message: "entry visible on all nodes within the propagation window".to_string(),
            })
        } else {
            Ok(ProbeResult {
                success: false,
                latency_ms,
                message: format!("entry not visible on: {}", unread_on.join(", ")),
            })
        }
    }
}

/// Number of seconds of clock drift between two nodes' `contextCSN` timestamps that
/// still counts as "in sync": the `#sid#mod#count` suffix is server-local and must
/// never be compared, only the leading timestamp, and only approximately.
const CSN_SYNC_TOLERANCE_SECS: i64 = 1;

/// Parses the leading `YYYYMMDDhhmmss.ffffffZ` timestamp out of an OpenLDAP
/// `contextCSN`, ignoring the trailing `#sid#mod#count` suffix.
fn parse_csn_timestamp(csn: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let stamp = csn.split('#').next()?;
    let datetime = chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S%.fZ").ok()?;
    Some(datetime.and_utc())
}

/// Parses an OpenLDAP `contextCSN` (`YYYYMMDDhhmmss.ffffffZ#...`) and returns the
/// number of seconds between that timestamp and now, or `None` if malformed.
fn parse_csn_age_seconds(csn: &str) -> Option<i64> {
    let csn_unix = parse_csn_timestamp(csn)?.timestamp();
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_secs() as i64;
    Some((now_unix - csn_unix).max(0))
}

#[cfg(test)]
mod tests {
    use super::{parse_csn_age_seconds, NodeSnapshot, ReplicationMonitor};

    fn snapshot(csn: Option<&str>) -> NodeSnapshot {
        NodeSnapshot {
            label: "n".into(),
            host: "h:389".into(),
            context_csn: csn.map(str::to_string),
            sync_age_s: None,
            reachable: csn.is_some(),
        }
    }

    #[test]
    fn identical_csns_are_in_sync() {
        let csn = "20260101000000.000000Z#000000#000#000000";
        let snapshots = vec![snapshot(Some(csn)), snapshot(Some(csn))];
        assert!(ReplicationMonitor::in_sync(&snapshots));
    }

    #[test]
    fn divergent_csns_are_not_in_sync() {
        let snapshots = vec![
            snapshot(Some("20260101000000.000000Z#000000#000#000000")),
            snapshot(Some("20260101000100.000000Z#000000#000#000000")),
        ];
        assert!(!ReplicationMonitor::in_sync(&snapshots));
    }

    #[test]
    fn nodes_missing_csn_are_excluded_from_comparison() {
        let snapshots = vec![
            snapshot(Some("20260101000000.000000Z#000000#000#000000")),
            snapshot(None),
        ];
        assert!(ReplicationMonitor::in_sync(&snapshots));
    }

    #[test]
    fn empty_comparison_set_is_vacuously_in_sync() {
        let snapshots = vec![snapshot(None), snapshot(None)];
        assert!(ReplicationMonitor::in_sync(&snapshots));
    }

    #[test]
    fn parses_context_csn_age() {
        let age = parse_csn_age_seconds("20260101000000.000000Z#000000#000#000000");
        assert!(age.is_some());
    }

    #[test]
    fn malformed_csn_returns_none() {
        assert!(parse_csn_age_seconds("not-a-csn").is_none());
    }

    #[test]
    fn differing_replica_suffixes_within_tolerance_are_in_sync() {
        let snapshots = vec![
            snapshot(Some("20260101000000.000000Z#000000#001#000007")),
            snapshot(Some("20260101000001.000000Z#000000#002#000003")),
        ];
        assert!(ReplicationMonitor::in_sync(&snapshots));
    }
}
