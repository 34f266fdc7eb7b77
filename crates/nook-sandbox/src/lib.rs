//! Nook Sandbox - workspace confinement
//!
//! Every path a client hands us is hostile until `PathResolver` says
//! otherwise. `WorkspaceStore` is the only thing allowed to touch the
//! filesystem, and it only ever sees resolved paths.

pub mod error;
pub mod path;
pub mod store;

pub use error::SandboxError;
pub use path::{EscapePolicy, PathResolver};
pub use store::{DirEntry, FileHandle, WorkspaceStore};
