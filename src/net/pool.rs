//! Session pool keyed by `(cluster, host, port, bind_dn)` (§4.3).
//!
//! Structurally this mirrors a sharded idle-connection queue: a per-key lock guards a
//! small deque of idle sessions, opening a fresh one when the deque is empty and the
//! key hasn't hit its per-key cap. A background reaper periodically evicts sessions
//! that have sat idle past the configured TTL.

use std::{
    collections::{HashMap, VecDeque},
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    session::{Fingerprint, Session},
    Host, Result,
};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("too many open sessions for this key")]
    NoMoreSessions,
    #[error(transparent)]
    Net(#[from] super::NetError),
}

impl PoolError {
    #[must_use]
    pub fn kind(&self) -> crate::errors::ErrorKind {
        match self {
            Self::NoMoreSessions => crate::errors::ErrorKind::ServiceUnavailable,
            Self::Net(_) => crate::errors::ErrorKind::ServiceUnavailable,
        }
    }
}

/// Resolves the bind password for a fingerprint at acquire time, backed by the
/// credential vault. A trait rather than a closure so it can be mocked in tests.
#[async_trait::async_trait]
pub trait PasswordProvider: Send + Sync {
    async fn password_for(&self, cluster: &str) -> Result<String, crate::errors::Error>;
}

struct KeyQueue {
    idle: Mutex<VecDeque<Session>>,
    open_count: std::sync::atomic::AtomicUsize,
    capacity: usize,
}

/// Pool of authenticated LDAP sessions shared across all clusters known to the
/// process, keyed by [`Fingerprint`].
pub struct SessionPool {
    queues: Mutex<HashMap<Fingerprint, Arc<KeyQueue>>>,
    per_key_capacity: usize,
    net_timeout: Duration,
    idle_ttl: Duration,
}

impl SessionPool {
    #[must_use]
    pub fn new(per_key_capacity: usize, net_timeout: Duration, idle_ttl: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            per_key_capacity,
            net_timeout,
            idle_ttl,
        }
    }

    async fn queue_for(&self, key: &Fingerprint) -> Arc<KeyQueue> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(KeyQueue {
                    idle: Mutex::new(VecDeque::new()),
                    open_count: std::sync::atomic::AtomicUsize::new(0),
                    capacity: self.per_key_capacity,
                })
            })
            .clone()
    }

    /// Acquires a session for `key`, opening a fresh one via `passwords` + a simple
    /// bind if no healthy idle session is available.
    pub async fn acquire(
        &self,
        key: Fingerprint,
        node: &Host,
        passwords: &dyn PasswordProvider,
    ) -> Result<PooledSession, crate::errors::Error> {
        let queue = self.queue_for(&key).await;

        let mut reusable = None;
        {
            let mut idle = queue.idle.lock().await;
            while let Some(session) = idle.pop_back() {
                if session.is_idle_expired(self.idle_ttl) {
                    queue
                        .open_count
                        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                    debug!(cluster = %key.cluster, "dropping idle-expired session");
                    tokio::spawn(session.close());
                    continue;
                }
                reusable = Some(session);
                break;
            }
        }
        if let Some(session) = reusable {
            return Ok(PooledSession::new(queue, session));
        }

        use std::sync::atomic::Ordering;
        if queue.open_count.load(Ordering::Relaxed) >= queue.capacity {
            return Err(PoolError::NoMoreSessions.into());
        }
        queue.open_count.fetch_add(1, Ordering::Relaxed);

        let password = match passwords.password_for(&key.cluster).await {
            Ok(p) => p,
            Err(e) => {
                queue.open_count.fetch_sub(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        match Session::open(key.clone(), node, &password, self.net_timeout).await {
            Ok(session) => Ok(PooledSession::new(queue, session)),
            Err(e) => {
                queue.open_count.fetch_sub(1, Ordering::Relaxed);
                Err(match &e {
                    super::NetError::Bind(msg) => crate::errors::Error::AuthFailed(msg.clone()),
                    super::NetError::Timeout => crate::errors::Error::Timeout(e.to_string()),
                    super::NetError::Connect(msg) => {
                        crate::errors::Error::ServiceUnavailable(msg.clone())
                    }
                })
            }
        }
    }

    /// Closes every idle session across every key. In-flight checked-out sessions are
    /// unaffected; they return themselves (or get dropped) as usual.
    pub async fn drain(&self) {
        let queues = self.queues.lock().await;
        for queue in queues.values() {
            let mut idle = queue.idle.lock().await;
            for session in idle.drain(..) {
                session.close().await;
            }
            queue
                .open_count
                .store(0, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Background reaper: evicts idle-expired sessions from every key. Intended to be
    /// driven by a `tokio::time::interval` at most half of `idle_ttl`, per §4.3.
    pub async fn reap_once(&self) {
        let queues = self.queues.lock().await;
        for (key, queue) in queues.iter() {
            let mut idle = queue.idle.lock().await;
            let before = idle.len();
            idle.retain(|s| !s.is_idle_expired(self.idle_ttl));
            let evicted = before - idle.len();
            if evicted > 0 {
                queue
                    .open_count
                    .fetch_sub(evicted, std::sync::atomic::Ordering::Relaxed);
                debug!(cluster = %key.cluster, evicted, "reaped idle sessions");
            }
        }
    }
}

/// A checked-out session. Returned to the pool on drop (healthy) unless explicitly
/// [`invalidate`](Self::invalidate)d (unhealthy), mirroring the pooled-connection
/// auto-return pattern.
pub struct PooledSession {
    queue: Option<Arc<KeyQueue>>,
    session: Option<Session>,
}

impl PooledSession {
    fn new(queue: Arc<KeyQueue>, session: Session) -> Self {
        Self {
            queue: Some(queue),
            session: Some(session),
        }
    }

    /// Discards the underlying connection instead of returning it to the pool; use
    /// this after a timeout or a protocol error.
    pub async fn invalidate(mut self) {
        if let (Some(queue), Some(session)) = (self.queue.take(), self.session.take()) {
            queue
                .open_count
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            session.close().await;
        }
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().expect("session taken")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().expect("session taken")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let (Some(queue), Some(mut session)) = (self.queue.take(), self.session.take()) {
            session.touch();
            tokio::spawn(async move {
                let mut idle = queue.idle.lock().await;
                if idle.len() < queue.capacity {
                    idle.push_back(session);
                } else {
                    warn!("session queue full on release, closing instead of pooling");
                    drop(idle);
                    queue
                        .open_count
                        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                    session.close().await;
                }
            });
        }
    }
}
