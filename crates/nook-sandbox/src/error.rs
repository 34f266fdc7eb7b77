use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Refusing to remove the workspace root")]
    RootProtected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether the caller sent something we will never accept, as opposed
    /// to the filesystem failing underneath a well-formed request.
    pub fn is_client_error(&self) -> bool {
        matches!(self, SandboxError::InvalidPath(_) | SandboxError::RootProtected)
    }
}
