pub use self::{
    host::Host,
    pool::{PasswordProvider, PoolError, PooledSession, SessionPool},
    session::{Fingerprint, Session},
};

pub mod host;
mod pool;
mod session;

pub type Result<T, E = NetError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("connect timed out")]
    Timeout,
    #[error("could not open network connection: {0}")]
    Connect(String),
    #[error("simple bind failed: {0}")]
    Bind(String),
}
