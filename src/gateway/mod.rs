//! Typed wrappers around bind/search/add/modify/delete with timeouts, RFC 4515
//! filter escaping, and RFC 2696 paged iteration (§4.4).
//!
//! # Examples
//!
//! ```rust,no_run
//! use directory_gateway_core::gateway::filter;
//!
//! let filter_expr = filter::compose("(objectClass=*)", &["uid", "cn"], "jdoe");
//! assert!(filter_expr.starts_with("(&"));
//! ```

pub mod filter;
pub mod paged;
pub mod placeholders;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use ldap3::{LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::ClusterConfig,
    errors::{Error, ErrorKind},
    net::{Fingerprint, Host, PasswordProvider, SessionPool},
};

pub use paged::{Page, PagedSearch, MAX_PAGE_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("bind rejected: {0}")]
    Bind(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("mutation failed: {0}")]
    Mutation(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl GatewayError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bind(_) => ErrorKind::AuthFailed,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Connect(_) => ErrorKind::ServiceUnavailable,
            Self::Search(_) | Self::Mutation(_) => ErrorKind::Unprocessable,
        }
    }
}

/// Outcome of a single mutation, mirroring the `idle -> acquired -> sent ->
/// {committed, rejected, timed_out}` state machine in §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Committed,
    Rejected,
    TimedOut,
}

/// Result of [`LdapGateway::bind_test`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Success,
    AuthFailed,
    Unreachable,
    Timeout,
}

/// Per-cluster write lock guarding `next_uid` allocation, so two concurrent
/// creations never read the same max and collide (§4.4, §9).
#[derive(Default)]
pub struct NextUidAllocators {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NextUidAllocators {
    async fn lock_for(&self, cluster: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Facade over pooled/ad-hoc LDAP sessions implementing the gateway contract.
pub struct LdapGateway {
    pool: Arc<SessionPool>,
    op_timeout: Duration,
    net_timeout: Duration,
    uid_locks: NextUidAllocators,
}

impl LdapGateway {
    #[must_use]
    pub fn new(pool: Arc<SessionPool>, net_timeout: Duration, op_timeout: Duration) -> Self {
        Self {
            pool,
            op_timeout,
            net_timeout,
            uid_locks: NextUidAllocators::default(),
        }
    }

    /// Opens a short-lived connection outside the pool and attempts a simple bind.
    pub async fn bind_test(&self, node: &Host, bind_dn: &str, password: &str) -> BindOutcome {
        let opened = tokio::time::timeout(
            self.net_timeout,
            LdapConnAsync::with_settings(LdapConnSettings::new(), &node.ldap_url()),
        )
        .await;
        let (conn, mut ldap) = match opened {
            Ok(Ok(pair)) => pair,
            Ok(Err(_)) => return BindOutcome::Unreachable,
            Err(_) => return BindOutcome::Timeout,
        };
        ldap3::drive!(conn);

        match tokio::time::timeout(self.op_timeout, ldap.simple_bind(bind_dn, password)).await {
            Ok(Ok(res)) => {
                let _ = ldap.unbind().await;
                if res.success().is_ok() {
                    BindOutcome::Success
                } else {
                    BindOutcome::AuthFailed
                }
            }
            Ok(Err(_)) => {
                let _ = ldap.unbind().await;
                BindOutcome::AuthFailed
            }
            Err(_) => BindOutcome::Timeout,
        }
    }

    /// Begins a paged search, routed through the pool (READ-class session).
    pub async fn search_paged(
        &self,
        fingerprint: Fingerprint,
        node: &Host,
        passwords: &dyn PasswordProvider,
        base_dn: &str,
        scope: Scope,
        filter_expr: &str,
        attributes: Vec<String>,
        page_size: i32,
        max_pages: usize,
    ) -> Result<PagedSearch, Error> {
        let session = self.pool.acquire(fingerprint, node, passwords).await?;
        Ok(PagedSearch::new(
            session,
            base_dn,
            scope,
            filter_expr,
            attributes,
            page_size,
            max_pages,
        ))
    }

    /// Single base-scope read.
    pub async fn read_entry(
        &self,
        fingerprint: Fingerprint,
        node: &Host,
        passwords: &dyn PasswordProvider,
        dn: &str,
        attributes: Vec<String>,
    ) -> Result<Option<SearchEntry>, Error> {
        let mut session = self.pool.acquire(fingerprint, node, passwords).await?;
        let result = tokio::time::timeout(
            self.op_timeout,
            session
                .ldap()
                .search(dn, Scope::Base, "(objectClass=*)", attributes),
        )
        .await;
        match result {
            Ok(Ok(search)) => match search.success() {
                Ok((entries, _)) => Ok(entries.into_iter().next().map(SearchEntry::construct)),
                Err(_) => Ok(None),
            },
            Ok(Err(e)) => Err(Error::Gateway(GatewayError::Search(e.to_string()))),
            Err(_) => {
                session.invalidate().await;
                Err(Error::Timeout(format!("read_entry({dn})")))
            }
        }
    }

    /// Reads root DSE operational attributes, including `contextCSN`.
    pub async fn root_dse(
        &self,
        fingerprint: Fingerprint,
        node: &Host,
        passwords: &dyn PasswordProvider,
    ) -> Result<SearchEntry, Error> {
        self.read_entry(
            fingerprint,
            node,
            passwords,
            "",
            vec!["contextCSN".to_string(), "namingContexts".to_string()],
        )
        .await?
        .ok_or_else(|| Error::NotFound("root DSE".into()))
    }

    /// Adds a new entry, routed to the WRITE node by the caller.
    pub async fn add(
        &self,
        fingerprint: Fingerprint,
        node: &Host,
        passwords: &dyn PasswordProvider,
        dn: &str,
        attributes: Vec<(String, HashSet<String>)>,
    ) -> Result<MutationOutcome, Error> {
        let mut session = self.pool.acquire(fingerprint, node, passwords).await?;
        let attrs: Vec<(&str, HashSet<&str>)> = attributes
            .iter()
            .map(|(k, v)| (k.as_str(), v.iter().map(String::as_str).collect()))
            .collect();
        let result = tokio::time::timeout(self.op_timeout, session.ldap().add(dn, attrs)).await;
        self.finish_mutation(session, dn, "add", result).await
    }

    /// Modifies an existing entry.
    pub async fn modify(
        &self,
        fingerprint: Fingerprint,
        node: &Host,
        passwords: &dyn PasswordProvider,
        dn: &str,
        changes: Vec<Mod<String>>,
    ) -> Result<MutationOutcome, Error> {
        let mut session = self.pool.acquire(fingerprint, node, passwords).await?;
        let result = tokio::time::timeout(self.op_timeout, session.ldap().modify(dn, changes)).await;
        self.finish_mutation(session, dn, "modify", result).await
    }

    /// Deletes an entry.
    pub async fn delete(
        &self,
        fingerprint: Fingerprint,
        node: &Host,
        passwords: &dyn PasswordProvider,
        dn: &str,
    ) -> Result<MutationOutcome, Error> {
        let mut session = self.pool.acquire(fingerprint, node, passwords).await?;
        let result = tokio::time::timeout(self.op_timeout, session.ldap().delete(dn)).await;
        self.finish_mutation(session, dn, "delete", result).await
    }

    async fn finish_mutation(
        &self,
        session: crate::net::PooledSession,
        dn: &str,
        operation: &str,
        result: Result<ldap3::result::Result<ldap3::LdapResult>, tokio::time::error::Elapsed>,
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
                session.invalidate().await;
                Ok(MutationOutcome::TimedOut)
            }
        }
    }

    /// Resolves `next_uid` for `cluster` under a per-cluster write lock so two
    /// concurrent creations can't read the same max, then calls `try_create` with
    /// successive candidates until it reports no collision or three attempts are
    /// exhausted (§4.4, §9).
    pub async fn allocate_next_uid<M, C, FutM, FutC>(
        &self,
        cluster: &ClusterConfig,
        current_max: M,
        try_create: C,
    ) -> Result<i64, Error>
    where
        M: Fn() -> FutM,
        FutM: std::future::Future<Output = Result<Option<i64>, Error>>,
        C: Fn(i64) -> FutC,
        FutC: std::future::Future<Output = Result<bool, Error>>,
    {
        let lock = self.uid_locks.lock_for(&cluster.name).await;
        let _guard = lock.lock().await;

        let mut candidate = current_max()
            .await?
            .map_or(placeholders::UID_FLOOR, |max| (max + 1).max(placeholders::UID_FLOOR));

        for _ in 0..3 {
            if try_create(candidate).await? {
                return Ok(candidate);
            }
            candidate += 1;
        }
        Err(Error::Conflict(format!(
            "uidNumber allocation collided 3 times for '{}'",
            cluster.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::LdapGateway;
    use crate::{
        config::{ClusterConfig, CreationTemplate, PasswordPolicy},
        net::SessionPool,
    };

    fn cluster() -> ClusterConfig {
        ClusterConfig {
            name: "c1".into(),
            host: None,
            nodes: Some(vec![]),
            bind_dn: "cn=admin,dc=x".into(),
            base_dn: "dc=x".into(),
            readonly: false,
            password_policy: PasswordPolicy::default(),
            user_template: CreationTemplate {
                object_classes: vec!["inetOrgPerson".into()],
                dn_pattern: "uid=${uid},ou=people,dc=x".into(),
                attributes: HashMap::new(),
            },
            columns: HashMap::new(),
        }
    }

    fn gateway() -> LdapGateway {
        let pool = Arc::new(SessionPool::new(1, Duration::from_secs(1), Duration::from_secs(1)));
        LdapGateway::new(pool, Duration::from_secs(1), Duration::from_secs(1))
    }

    async fn no_max() -> std::result::Result<Option<i64>, crate::errors::Error> {
        Ok(None)
    }

    #[tokio::test]
    async fn allocates_floor_on_empty_subtree() {
        let gateway = gateway();
        let cluster = cluster();
        let uid = gateway
            .allocate_next_uid(&cluster, no_max, |_candidate| async {
                Ok::<bool, crate::errors::Error>(true)
            })
            .await
            .unwrap();
        assert_eq!(uid, super::placeholders::UID_FLOOR);
    }

    #[tokio::test]
    async fn retries_past_collisions_up_to_three_times() {
        let gateway = gateway();
        let cluster = cluster();
        let taken: HashSet<i64> = HashSet::from([2000, 2001]);
        let taken = Mutex::new(taken);

        let uid = gateway
            .allocate_next_uid(&cluster, no_max, |candidate| {
                let already_taken = taken.lock().unwrap().contains(&candidate);
                async move { Ok::<bool, crate::errors::Error>(!already_taken) }
            })
            .await
            .unwrap();
        assert_eq!(uid, 2002);
    }

    #[tokio::test]
    async fn gives_up_as_conflict_after_three_collisions() {
        let gateway = gateway();
        let cluster = cluster();
        let err = gateway
            .allocate_next_uid(&cluster, no_max, |_candidate| async {
                Ok::<bool, crate::errors::Error>(false)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Conflict);
    }
}
