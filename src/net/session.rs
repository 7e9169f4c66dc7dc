use std::time::{Duration, Instant};

use ldap3::{Ldap, LdapConnAsync, LdapConnSettings};

use super::{Host, NetError, Result};

/// `(cluster_name, host, port, bind_dn)` — the pool key, used verbatim as the
/// "fingerprint" named in the glossary.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub cluster: String,
    pub host: String,
    pub port: u16,
    pub bind_dn: String,
}

impl Fingerprint {
    #[must_use]
    pub fn new(cluster: impl Into<String>, node: &Host, bind_dn: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            host: node.name.clone(),
            port: node.port,
            bind_dn: bind_dn.into(),
        }
    }
}

/// An authenticated LDAP session plus the bookkeeping the pool needs.
pub struct Session {
    pub(crate) fingerprint: Fingerprint,
    pub(crate) ldap: Ldap,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
}

impl Session {
    /// Opens a fresh authenticated connection outside of any pool.
    pub async fn open(
        fingerprint: Fingerprint,
        node: &Host,
        password: &str,
        net_timeout: Duration,
    ) -> Result<Self> {
        let (conn, mut ldap) = tokio::time::timeout(
            net_timeout,
            LdapConnAsync::with_settings(LdapConnSettings::new(), &node.ldap_url()),
        )
        .await
        .map_err(|_| NetError::Timeout)?
        .map_err(|e| NetError::Connect(e.to_string()))?;
        ldap3::drive!(conn);

        let bind = tokio::time::timeout(net_timeout, ldap.simple_bind(&fingerprint.bind_dn, password))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|e| NetError::Bind(e.to_string()))?;
        bind.success().map_err(|e| NetError::Bind(e.to_string()))?;

        let now = Instant::now();
        Ok(Self {
            fingerprint,
            ldap,
            created_at: now,
            last_used_at: now,
        })
    }

    #[must_use]
    pub fn is_idle_expired(&self, idle_ttl: Duration) -> bool {
        self.last_used_at.elapsed() > idle_ttl
    }

    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub fn ldap(&mut self) -> &mut Ldap {
        &mut self.ldap
    }

    pub async fn close(mut self) {
        let _ = self.ldap.unbind().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("fingerprint", &self.fingerprint)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}
