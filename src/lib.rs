#![forbid(unsafe_code)]
#![warn(
    rust_2018_idioms,
    clippy::all,
    clippy::pedantic,
    clippy::clone_on_ref_ptr,
    clippy::format_push_string,
    clippy::get_unwrap,
    clippy::mem_forget,
    clippy::mutex_atomic,
    clippy::rc_buffer,
    clippy::rc_mutex,
    clippy::self_named_module_files,
    clippy::str_to_string,
    clippy::wildcard_imports,
    clippy::string_add,
    clippy::string_to_string,
    clippy::try_err,
    clippy::unreachable
)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::missing_errors_doc,
    clippy::manual_let_else,
    missing_docs
)]

//! Core of a multi-cluster directory-service management gateway: it sits between
//! an (external) HTTP layer and one or more LDAP v3 directory clusters, handling
//! session pooling, node selection and failover, credential caching, filter
//! escaping, paginated search, declarative entry creation, and replication
//! visibility.
//!
//! This crate has no HTTP surface of its own; it is the engine an HTTP handler
//! layer is expected to drive through [`directory::DirectoryService`] and
//! [`replication::ReplicationMonitor`].
//!
//! # Examples
//!
//! Wiring the pieces together for one configured cluster.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use directory_gateway_core::{
//!     config::{GatewayConfig, RuntimeTuning},
//!     directory::DirectoryService,
//!     gateway::LdapGateway,
//!     net::SessionPool,
//!     vault::CredentialVault,
//! };
//!
//! # async fn run(config: GatewayConfig) -> Result<(), directory_gateway_core::errors::Error> {
//! config.validate()?;
//! let tuning = RuntimeTuning::from_env();
//! let vault = Arc::new(CredentialVault::open("/var/lib/gateway/secrets")?);
//! let pool = Arc::new(SessionPool::new(8, tuning.net_timeout, tuning.pool_idle_ttl));
//! let gateway = Arc::new(LdapGateway::new(pool, tuning.net_timeout, tuning.op_timeout));
//! let _directory = DirectoryService::new(Arc::new(config), gateway, vault);
//! # Ok(())
//! # }
//! ```

pub use config::GatewayConfig;
pub use directory::DirectoryService;
pub use errors::{Error, ErrorKind, Result};
pub use gateway::LdapGateway;
pub use net::{Host, SessionPool};
pub use replication::ReplicationMonitor;
pub use vault::CredentialVault;

pub mod config;
pub mod directory;
pub mod errors;
pub mod gateway;
pub mod net;
pub mod replication;
pub mod selector;
pub mod vault;
