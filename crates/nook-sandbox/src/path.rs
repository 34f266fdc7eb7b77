//! Untrusted path resolution
//!
//! Pure string/path work with no filesystem access. A client path is
//! normalized as if it were rooted at a synthetic `/`, so `..` can never
//! climb past that root, then joined onto the workspace root and checked
//! for containment a second time before anyone is allowed to do I/O.

use std::path::{Component, Path, PathBuf};

use crate::SandboxError;

/// What to do with a `..` that would climb above the workspace root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscapePolicy {
    /// Absorb it: `../../etc/passwd` resolves to `<root>/etc/passwd`
    #[default]
    Clamp,
    /// Fail with `InvalidPath`
    Reject,
}

/// Maps client-supplied relative paths onto the workspace root
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    escape_policy: EscapePolicy,
}

impl PathResolver {
    /// The root must be absolute. It is normalized lexically; callers that
    /// want symlinks in the root itself resolved should canonicalize first.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SandboxError> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(SandboxError::InvalidPath(format!(
                "workspace root must be absolute: {}",
                root.display()
            )));
        }

        Ok(Self {
            root: normalize_absolute(&root),
            escape_policy: EscapePolicy::default(),
        })
    }

    pub fn with_escape_policy(mut self, policy: EscapePolicy) -> Self {
        self.escape_policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn escape_policy(&self) -> EscapePolicy {
        self.escape_policy
    }

    /// Resolve a relative path to an absolute one inside the root.
    ///
    /// `""`, `"."` and `"/"` all resolve to the root itself.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, SandboxError> {
        let segments = self.normalize(relative)?;

        let mut resolved = self.root.clone();
        for segment in segments {
            resolved.push(segment);
        }

        if !self.contains(&resolved) {
            return Err(SandboxError::InvalidPath(relative.to_string()));
        }
        Ok(resolved)
    }

    /// Resolve `name` as a direct child of `dir`.
    ///
    /// `name` must be a single plain segment. Upload file names come from
    /// the client, so `../x`, `a/b` and friends are refused outright rather
    /// than normalized.
    pub fn resolve_file_name(&self, dir: &str, name: &str) -> Result<PathBuf, SandboxError> {
        if !is_plain_segment(name) {
            return Err(SandboxError::InvalidPath(format!("bad file name: {name:?}")));
        }

        let target = self.resolve(dir)?.join(name);
        if !self.contains(&target) {
            return Err(SandboxError::InvalidPath(name.to_string()));
        }
        Ok(target)
    }

    /// Component-wise containment check: `<root>2/x` is not inside `<root>`.
    pub fn contains(&self, candidate: &Path) -> bool {
        match candidate.strip_prefix(&self.root) {
            Ok(tail) => tail
                .components()
                .all(|c| matches!(c, Component::Normal(_))),
            Err(_) => false,
        }
    }

    /// Root-relative, slash-separated form of a resolved path, for logs
    /// and error messages. Never exposes the absolute root.
    pub fn relative_display(&self, resolved: &Path) -> String {
        let tail = resolved.strip_prefix(&self.root).unwrap_or(resolved);
        let parts: Vec<_> = tail
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", parts.join("/"))
    }

    fn normalize<'a>(&self, relative: &'a str) -> Result<Vec<&'a str>, SandboxError> {
        if relative.contains('\0') {
            return Err(SandboxError::InvalidPath("path contains a NUL byte".to_string()));
        }

        let mut stack: Vec<&str> = Vec::new();
        for segment in relative.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if stack.pop().is_none() && self.escape_policy == EscapePolicy::Reject {
                        return Err(SandboxError::InvalidPath(format!(
                            "{relative} escapes the workspace"
                        )));
                    }
                }
                other => stack.push(other),
            }
        }
        Ok(stack)
    }
}

fn is_plain_segment(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn normalize_absolute(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
