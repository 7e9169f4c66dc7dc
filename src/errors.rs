//! Error and Result types for the gateway core.
//!
//! # Examples
//!
//! Handling an error returned by the directory service.
//!
//! ```rust
//! use directory_gateway_core::errors::{Error, ErrorKind};
//!
//! fn describe(err: &Error) -> &'static str {
//!     match err.kind() {
//!         ErrorKind::NotFound => "no such entry",
//!         ErrorKind::AuthFailed => "bind rejected",
//!         _ => "other failure",
//!     }
//! }
//! ```

#![allow(missing_docs)]

pub use crate::{
    gateway::{filter::FilterError, GatewayError},
    net::{NetError, PoolError},
    vault::VaultError,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Stable, HTTP-mappable classification of an [`Error`]. The HTTP boundary (out of
/// scope for this crate) is the only place this should be rendered to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    AuthFailed,
    Forbidden,
    NotFound,
    Conflict,
    Unprocessable,
    Timeout,
    ServiceUnavailable,
    PartialSuccess,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    BadRequest(String),
    #[error("LDAP bind rejected: {0}")]
    AuthFailed(String),
    #[error("cluster '{0}' is read-only")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("server rejected the request: {0}")]
    Unprocessable(String),
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("no reachable node: {0}")]
    ServiceUnavailable(String),
    #[error("group membership transaction partially failed")]
    PartialSuccess(Vec<(String, String)>),
    #[error("unexpected internal error: {0}")]
    Internal(String),

    #[error("credential vault error")]
    Vault(#[from] VaultError),
    #[error("connection pool error")]
    Pool(#[from] PoolError),
    #[error("network error")]
    Net(#[from] NetError),
    #[error("LDAP gateway error")]
    Gateway(#[from] GatewayError),
    #[error("filter escaping error")]
    Filter(#[from] FilterError),
    #[error("configuration error")]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) | Self::Filter(_) => ErrorKind::BadRequest,
            Self::AuthFailed(_) => ErrorKind::AuthFailed,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unprocessable(_) => ErrorKind::Unprocessable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ServiceUnavailable(_) => ErrorKind::ServiceUnavailable,
            Self::PartialSuccess(_) => ErrorKind::PartialSuccess,
            Self::Internal(_) | Self::Config(_) => ErrorKind::Internal,
            Self::Vault(e) => e.kind(),
            Self::Pool(e) => e.kind(),
            Self::Net(_) => ErrorKind::ServiceUnavailable,
            Self::Gateway(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};

    #[test]
    fn kind_mapping_is_stable() {
        assert_eq!(Error::Forbidden("c1".into()).kind(), ErrorKind::Forbidden);
        assert_eq!(
            Error::PartialSuccess(vec![("g1".into(), "timeout".into())]).kind(),
            ErrorKind::PartialSuccess
        );
    }
}
