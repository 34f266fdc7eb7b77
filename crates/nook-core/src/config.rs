//! Startup configuration
//!
//! Built once in `main` and shared read-only with every handler.
//! Nothing here changes after boot.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use nook_sandbox::{EscapePolicy, PathResolver, SandboxError, WorkspaceStore};

use crate::auth::AuthToken;
use crate::exec::{ExecPolicy, ExecutionGateway};

#[derive(Debug)]
pub struct NookConfig {
    pub bind: SocketAddr,
    pub token: AuthToken,
    /// Absolute, canonical workspace directory
    pub workspace_root: PathBuf,
    /// Static assets served at `/`, if any
    pub public_dir: Option<PathBuf>,
    pub exec: ExecPolicy,
    pub escape_policy: EscapePolicy,
    pub confine_symlinks: bool,
    pub max_upload_bytes: usize,
}

impl NookConfig {
    pub fn store(&self) -> Result<WorkspaceStore, SandboxError> {
        let resolver = PathResolver::new(&self.workspace_root)?.with_escape_policy(self.escape_policy);
        Ok(WorkspaceStore::new(resolver).with_symlink_confinement(self.confine_symlinks))
    }

    pub fn gateway(&self) -> ExecutionGateway {
        ExecutionGateway::new(&self.workspace_root, self.exec.clone())
    }
}

/// Create the workspace directory if needed and return its canonical path
pub fn prepare_workspace(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(path)?;
    std::fs::canonicalize(path)
}
