//! castor — OAuth account broker and request-rewriting engine for the
//! Antigravity code-assist upstream.
//!
//! The host hands every outbound generative call to [`Dispatcher::dispatch`];
//! the broker picks an account from the pool, refreshes its token when
//! needed, resolves the cloud project, rewrites the payload into the
//! upstream's project-wrapped wire format (repairing tool and thinking
//! state on the way), streams the response back and feeds rate-limit
//! signals into the pool.

pub mod accounts;
pub mod config;
pub mod dispatch;
pub mod endpoints;
pub mod error;
pub mod families;
pub mod host;
pub mod models;
pub mod project;
pub mod recovery;
pub mod repair;
pub mod response;
pub mod sigcache;
pub mod transform;
mod util;

pub use accounts::{Account, AccountManager, AccountsFile, CredentialStore, JsonFileStore};
pub use config::BrokerConfig;
pub use dispatch::{Broker, Dispatcher, HostRequest};
pub use error::{BrokerError, IsRetryable, OauthError};
pub use families::{HeaderStyle, ModelFamily, QuotaKey};
pub use host::{HostClient, HostSessionError, LogToasts, SilentToasts, ToastSink};
pub use models::{ResolvedModel, resolve};
pub use response::{BrokerBody, BrokerResponse};
pub use util::{init_logging, now_ms};
