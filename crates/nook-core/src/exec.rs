//! Snippet execution
//!
//! One child process per request. Node and Python get the source as a
//! single argv entry, never through a shell; only the shell language runs
//! `sh -c`. Interpreter failures (non-zero exit, signal, timeout, missing
//! binary) come back as text in `stderr`. Only malformed requests are errors.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long to keep reading pipes after a timeout kill
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Supported interpreters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Node,
    Python,
    Shell,
}

impl Language {
    /// Map an editor language tag to an interpreter
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "node" | "javascript" | "js" => Some(Language::Node),
            "python" | "py" => Some(Language::Python),
            "bash" | "shell" | "sh" => Some(Language::Shell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Node => "node",
            Language::Python => "python",
            Language::Shell => "shell",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a request never reaches an interpreter
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
}

/// Where the child runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// The workspace root; relative file writes land in the workspace
    #[default]
    Shared,
    /// A fresh temporary directory, removed after the run
    PrivateDir,
}

/// Interpreter binaries and limits
#[derive(Debug, Clone)]
pub struct ExecPolicy {
    pub node_program: String,
    pub python_program: String,
    pub shell_program: String,
    /// Wall-clock limit per run
    pub timeout: Duration,
    pub isolation: Isolation,
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self {
            node_program: "node".to_string(),
            python_program: "python3".to_string(),
            shell_program: "sh".to_string(),
            timeout: Duration::from_secs(10),
            isolation: Isolation::Shared,
        }
    }
}

/// Program and argv for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl ExecPolicy {
    pub fn invocation(&self, request: &ExecutionRequest) -> Invocation {
        let (program, flag) = match request.language {
            Language::Node => (&self.node_program, "-e"),
            Language::Python => (&self.python_program, "-c"),
            Language::Shell => (&self.shell_program, "-c"),
        };
        Invocation {
            program: program.clone(),
            args: vec![flag.to_string(), request.source.clone()],
        }
    }
}

/// A validated run request. Lives for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub language: Language,
    pub source: String,
}

impl ExecutionRequest {
    pub fn parse(language: &str, source: &str) -> Result<Self, ExecError> {
        if language.is_empty() || source.is_empty() {
            return Err(ExecError::BadRequest("language and code required".to_string()));
        }
        let language = Language::from_tag(language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(language.to_string()))?;
        Ok(Self {
            language,
            source: source.to_string(),
        })
    }
}

/// Captured output. `stderr` also carries the failure diagnostic, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecutionResult {
    fn failed(diagnostic: String) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: format!("{diagnostic}\n").into_bytes(),
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs snippets against a fixed working directory
#[derive(Debug, Clone)]
pub struct ExecutionGateway {
    workdir: PathBuf,
    policy: ExecPolicy,
}

impl ExecutionGateway {
    pub fn new(workdir: impl Into<PathBuf>, policy: ExecPolicy) -> Self {
        Self {
            workdir: workdir.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &ExecPolicy {
        &self.policy
    }

    /// Validate and run. `Err` only for a missing field or unknown language.
    pub async fn execute(&self, language: &str, source: &str) -> Result<ExecutionResult, ExecError> {
        let request = ExecutionRequest::parse(language, source)?;
        Ok(self.run(&request).await)
    }

    /// Run a validated request to completion or timeout.
    ///
    /// Dropping the returned future kills the child.
    pub async fn run(&self, request: &ExecutionRequest) -> ExecutionResult {
        let invocation = self.policy.invocation(request);

        let private_dir = match self.policy.isolation {
            Isolation::Shared => None,
            Isolation::PrivateDir => match tempfile::Builder::new().prefix("nook-exec-").tempdir() {
                Ok(dir) => Some(dir),
                Err(e) => {
                    warn!(error = %e, "could not create private execution directory");
                    return ExecutionResult::failed(format!(
                        "Failed to create private directory: {e}"
                    ));
                }
            },
        };
        let cwd = private_dir
            .as_ref()
            .map(|d| d.path())
            .unwrap_or(self.workdir.as_path());

        let started = Instant::now();
        let (result, outcome) = run_child(&invocation, cwd, self.policy.timeout).await;

        info!(
            language = %request.language,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = %outcome.as_deref().unwrap_or("ok"),
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "execution finished"
        );

        if let Some(dir) = private_dir {
            // TempDir removal is blocking I/O
            tokio::task::spawn_blocking(move || {
                if let Err(e) = dir.close() {
                    warn!(error = %e, "failed to remove private execution directory");
                }
            });
        }

        result
    }
}

/// Spawn, race the child against the timer, and fold any failure into stderr.
/// Returns the result and the diagnostic line (for logging).
async fn run_child(
    invocation: &Invocation,
    cwd: &Path,
    limit: Duration,
) -> (ExecutionResult, Option<String>) {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let diagnostic = format!("Failed to start {}: {}", invocation.program, e);
            return (ExecutionResult::failed(diagnostic.clone()), Some(diagnostic));
        }
    };
    debug!(program = %invocation.program, pid = ?child.id(), "spawned");
    // Declared after `child` so it drops first, while the leader is unreaped
    let mut group = ProcessGroupGuard::new(&child);

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let finished = tokio::time::timeout(limit, async {
        let (out, err) = tokio::join!(
            drain(stdout_pipe.as_mut(), &mut stdout),
            drain(stderr_pipe.as_mut(), &mut stderr),
        );
        out?;
        err?;
        child.wait().await
    })
    .await;

    let diagnostic = match finished {
        Ok(Ok(status)) => {
            group.disarm();
            describe_exit(status)
        }
        Ok(Err(e)) => {
            kill_process_group(&mut child, &mut group).await;
            Some(format!("Failed while running {}: {}", invocation.program, e))
        }
        Err(_) => {
            kill_process_group(&mut child, &mut group).await;
            // Pick up whatever was written before the kill
            let _ = tokio::time::timeout(KILL_GRACE, async {
                tokio::join!(
                    drain(stdout_pipe.as_mut(), &mut stdout),
                    drain(stderr_pipe.as_mut(), &mut stderr),
                )
            })
            .await;
            Some(format!("Execution timed out after {}s", limit.as_secs_f64()))
        }
    };

    if let Some(ref text) = diagnostic {
        let mut merged = Vec::with_capacity(text.len() + 1 + stderr.len());
        merged.extend_from_slice(text.as_bytes());
        merged.push(b'\n');
        merged.extend_from_slice(&stderr);
        stderr = merged;
    }

    (ExecutionResult { stdout, stderr }, diagnostic)
}

async fn drain<R>(reader: Option<&mut R>, buf: &mut Vec<u8>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// SIGKILLs the child's process group when dropped. `kill_on_drop` only
/// reaches the direct child, so this is what stops grandchildren when the
/// request future is abandoned mid-run. Disarmed once the child is reaped.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                debug!(error = %e, pgid, "killpg failed");
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

/// SIGKILL the child's whole process group so backgrounded grandchildren
/// can't hold the pipes open, then reap the child.
async fn kill_process_group(child: &mut Child, group: &mut ProcessGroupGuard) {
    group.kill();
    if let Err(e) = child.kill().await {
        debug!(error = %e, "kill after failure");
    }
}

fn describe_exit(status: ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    if let Some(code) = status.code() {
        return Some(format!("Process exited with code {code}"));
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(format!("Process terminated by signal {signal}"));
        }
    }
    Some(format!("Process failed: {status}"))
}
