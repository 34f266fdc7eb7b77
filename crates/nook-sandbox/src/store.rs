//! File CRUD on top of the resolver
//!
//! Every operation resolves its path argument first and fails with
//! `InvalidPath` before any I/O happens. There is no locking: two writers
//! racing on one file end with whichever rename landed last.

use std::io;
use std::path::{Path, PathBuf};

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{PathResolver, SandboxError};

/// Uploads in flight live under `<dir>/.nook-upload.<uuid>.part`. The name
/// is fixed-length so any legal target name still fits in NAME_MAX.
const STAGING_PREFIX: &str = ".nook-upload.";
const STAGING_SUFFIX: &str = ".part";

fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX)
}

/// One immediate child of a listed directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
}

/// An opened workspace file, ready to be streamed out
#[derive(Debug)]
pub struct FileHandle {
    pub file: fs::File,
    pub name: String,
    pub len: u64,
}

/// Filesystem access confined to one workspace root
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    resolver: PathResolver,
    confine_symlinks: bool,
}

impl WorkspaceStore {
    pub fn new(resolver: PathResolver) -> Self {
        Self {
            resolver,
            confine_symlinks: false,
        }
    }

    /// Also refuse paths whose existing prefix is a symlink leading out of
    /// the root. Costs a canonicalize per request.
    pub fn with_symlink_confinement(mut self, enabled: bool) -> Self {
        self.confine_symlinks = enabled;
        self
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Immediate children of `dir`, in whatever order the OS returns them
    pub async fn list(&self, dir: &str) -> Result<Vec<DirEntry>, SandboxError> {
        let target = self.resolver.resolve(dir)?;
        self.confine(&target, dir).await?;

        let meta = fs::metadata(&target).await.map_err(|e| missing(e, dir))?;
        if !meta.is_dir() {
            return Err(SandboxError::NotADirectory(dir.to_string()));
        }

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&target).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_staging_name(&name) {
                continue;
            }
            let is_dir = match entry.file_type().await {
                Ok(ft) => ft.is_dir(),
                Err(e) => {
                    warn!(error = %e, "file_type failed during listing");
                    false
                }
            };
            entries.push(DirEntry { name, is_dir });
        }

        debug!(path = %dir, count = entries.len(), "listed directory");
        Ok(entries)
    }

    /// Open a file for streaming. Content is not buffered here.
    pub async fn read(&self, path: &str) -> Result<FileHandle, SandboxError> {
        let target = self.resolver.resolve(path)?;
        self.confine(&target, path).await?;

        let meta = fs::metadata(&target).await.map_err(|e| missing(e, path))?;
        if meta.is_dir() {
            return Err(SandboxError::IsADirectory(path.to_string()));
        }

        let file = fs::File::open(&target).await.map_err(|e| missing(e, path))?;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());

        Ok(FileHandle {
            file,
            name,
            len: meta.len(),
        })
    }

    /// Persist `file_name` under `dir` from a stream of chunks.
    ///
    /// `dir` must already exist. The content lands in a hidden sibling
    /// first and is renamed into place, so readers never see a partial
    /// file. Returns the number of bytes written.
    pub async fn write<S, B>(
        &self,
        dir: &str,
        file_name: &str,
        mut content: S,
    ) -> Result<u64, SandboxError>
    where
        S: Stream<Item = io::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        let dir_path = self.resolver.resolve(dir)?;
        let target = self.resolver.resolve_file_name(dir, file_name)?;
        self.confine(&dir_path, dir).await?;

        let meta = fs::metadata(&dir_path).await.map_err(|e| missing(e, dir))?;
        if !meta.is_dir() {
            return Err(SandboxError::NotADirectory(dir.to_string()));
        }
        if let Ok(existing) = fs::symlink_metadata(&target).await {
            if existing.is_dir() {
                return Err(SandboxError::IsADirectory(
                    self.resolver.relative_display(&target),
                ));
            }
        }

        let staging = dir_path.join(format!(
            "{STAGING_PREFIX}{}{STAGING_SUFFIX}",
            uuid::Uuid::new_v4()
        ));
        let result = async {
            let mut file = fs::File::create(&staging).await?;
            let mut written = 0u64;
            while let Some(chunk) = content.next().await {
                let chunk = chunk?;
                file.write_all(chunk.as_ref()).await?;
                written += chunk.as_ref().len() as u64;
            }
            file.flush().await?;
            drop(file);
            fs::rename(&staging, &target).await?;
            Ok::<u64, io::Error>(written)
        }
        .await;

        match result {
            Ok(written) => {
                debug!(
                    path = %self.resolver.relative_display(&target),
                    bytes = written,
                    "wrote file"
                );
                Ok(written)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&staging).await {
                    if cleanup.kind() != io::ErrorKind::NotFound {
                        warn!(error = %cleanup, "failed to remove staging file");
                    }
                }
                Err(e.into())
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn write_bytes(
        &self,
        dir: &str,
        file_name: &str,
        content: &[u8],
    ) -> Result<u64, SandboxError> {
        let stream = futures_util::stream::iter([Ok::<_, io::Error>(content)]);
        self.write(dir, file_name, stream).await
    }

    /// Recursively delete a file or directory. Missing targets succeed.
    /// Symlinks are removed, never followed.
    pub async fn remove(&self, path: &str) -> Result<(), SandboxError> {
        let target = self.resolver.resolve(path)?;
        if target.as_path() == self.resolver.root() {
            return Err(SandboxError::RootProtected);
        }
        if let Some(parent) = target.parent() {
            self.confine(parent, path).await?;
        }

        let meta = match fs::symlink_metadata(&target).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let removed = if meta.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        match removed {
            Ok(()) => {
                debug!(path = %path, "removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a directory and any missing parents. Existing directories succeed.
    pub async fn make_directory(&self, path: &str) -> Result<(), SandboxError> {
        let target = self.resolver.resolve(path)?;
        self.confine(&target, path).await?;

        if let Err(e) = fs::create_dir_all(&target).await {
            return match fs::metadata(&target).await {
                Ok(meta) if !meta.is_dir() => Err(SandboxError::NotADirectory(path.to_string())),
                _ => Err(e.into()),
            };
        }
        Ok(())
    }

    /// With symlink confinement on, canonicalize the deepest existing
    /// ancestor of `target` and make sure it is still under the real root.
    async fn confine(&self, target: &Path, original: &str) -> Result<(), SandboxError> {
        if !self.confine_symlinks {
            return Ok(());
        }

        let real_root = fs::canonicalize(self.resolver.root()).await?;
        let mut probe: PathBuf = target.to_path_buf();
        loop {
            match fs::canonicalize(&probe).await {
                Ok(real) => {
                    return if real.starts_with(&real_root) {
                        Ok(())
                    } else {
                        warn!(path = %original, "symlink leads outside the workspace");
                        Err(SandboxError::InvalidPath(original.to_string()))
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if !probe.pop() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn missing(err: io::Error, rel: &str) -> SandboxError {
    if err.kind() == io::ErrorKind::NotFound {
        SandboxError::NotFound(rel.to_string())
    } else {
        SandboxError::Io(err)
    }
}
