//! Nook CLI - workspace server for the browser micro-IDE
//!
//! Usage:
//!   nook serve   - Serve the workspace over HTTP/WebSocket
//!   nook token   - Print a fresh random auth token

mod api;
mod events;
mod server;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use nook_core::config::prepare_workspace;
use nook_core::{AuthToken, ExecPolicy, Isolation, NookConfig};
use nook_sandbox::EscapePolicy;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::server::AppState;

#[derive(Parser)]
#[command(name = "nook")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Sandboxed workspace server for a browser micro-IDE", long_about = None)]
struct Cli {
    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the workspace
    Serve(ServeArgs),

    /// Print a random token suitable for AUTH_TOKEN
    Token,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Shared secret; a random one is generated and printed if unset
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Workspace directory, created if missing
    #[arg(long, env = "WORKSPACE_ROOT", default_value = "workspace")]
    workspace: PathBuf,

    /// Directory of static editor assets served at /
    #[arg(long, env = "PUBLIC_DIR")]
    public_dir: Option<PathBuf>,

    /// Wall-clock limit for each execution
    #[arg(long, env = "EXEC_TIMEOUT_SECS", default_value_t = 10,
          value_parser = clap::value_parser!(u64).range(1..))]
    exec_timeout_secs: u64,

    #[arg(long, env = "NODE_BIN", default_value = "node")]
    node_bin: String,

    #[arg(long, env = "PYTHON_BIN", default_value = "python3")]
    python_bin: String,

    #[arg(long, env = "SHELL_BIN", default_value = "sh")]
    shell_bin: String,

    /// Run each execution in a throwaway directory instead of the workspace
    #[arg(long, env = "ISOLATED_EXEC")]
    isolated_exec: bool,

    /// Reject paths that climb above the root instead of clamping them
    #[arg(long, env = "REJECT_ESCAPES")]
    reject_escapes: bool,

    /// Refuse paths that reach outside the root through symlinks
    #[arg(long, env = "CONFINE_SYMLINKS")]
    confine_symlinks: bool,

    /// Upload size limit in MiB
    #[arg(long, env = "MAX_UPLOAD_MB", default_value_t = 64)]
    max_upload_mb: usize,
}

impl ServeArgs {
    fn into_config(self) -> anyhow::Result<NookConfig> {
        let workspace_root = prepare_workspace(&self.workspace).with_context(|| {
            format!("Failed to prepare workspace {}", self.workspace.display())
        })?;

        let token = match self.token {
            Some(token) => AuthToken::new(token).context("Invalid AUTH_TOKEN")?,
            None => {
                let token = AuthToken::generate().context("Failed to generate auth token")?;
                warn!("AUTH_TOKEN not set, generated a one-time token");
                println!("🔑 Auth token: {}", token.reveal());
                token
            }
        };

        Ok(NookConfig {
            bind: SocketAddr::new(self.host, self.port),
            token,
            workspace_root,
            public_dir: self.public_dir,
            exec: ExecPolicy {
                node_program: self.node_bin,
                python_program: self.python_bin,
                shell_program: self.shell_bin,
                timeout: Duration::from_secs(self.exec_timeout_secs),
                isolation: if self.isolated_exec {
                    Isolation::PrivateDir
                } else {
                    Isolation::Shared
                },
            },
            escape_policy: if self.reject_escapes {
                EscapePolicy::Reject
            } else {
                EscapePolicy::Clamp
            },
            confine_symlinks: self.confine_symlinks,
            max_upload_bytes: self.max_upload_mb.saturating_mul(1024 * 1024),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "nook=debug,nook_core=debug,nook_sandbox=debug,tower_http=debug"
    } else {
        "nook=info,nook_core=info,nook_sandbox=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Token => {
            let token = AuthToken::generate()?;
            println!("{}", token.reveal());
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.into_config()?;
    let bind = config.bind;
    let public_dir = config.public_dir.clone();
    let max_upload_bytes = config.max_upload_bytes;

    info!(
        workspace = %config.workspace_root.display(),
        timeout_secs = config.exec.timeout.as_secs(),
        isolation = ?config.exec.isolation,
        escape_policy = ?config.escape_policy,
        confine_symlinks = config.confine_symlinks,
        "configuration loaded"
    );

    let state = Arc::new(AppState::from_config(config).context("Invalid workspace root")?);
    let app = server::router(state, public_dir.as_deref(), max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!("👁️  nook listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
