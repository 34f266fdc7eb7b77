//! Nook Core - execution, auth, and live relay
//!
//! Shared by the HTTP server and anything else that wants to run snippets
//! against a workspace.

pub mod auth;
pub mod config;
pub mod exec;
pub mod relay;

pub use auth::{AuthError, AuthToken};
pub use config::NookConfig;
pub use exec::{ExecError, ExecPolicy, ExecutionGateway, ExecutionResult, Isolation, Language};
pub use relay::{BroadcastRelay, RelayEvent, Session};
