//! foldrt: run a worker process behind the fold runtime.
//!
//! # Usage
//!
//! ```text
//! foldrt [--stage TEST|PROD] [--watch-dir <dir>] [--http-addr <addr>]
//!        [--crash-policy exit|keep-alive] [--socket-dir <dir>] <command> [args...]
//! ```
//!
//! Every flag falls back to its `FOLD_*` environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use fold_runtime::logging::init_tracing;
use fold_runtime::signals::forward_signals;
use fold_runtime::{CrashPolicy, HttpServer, Runtime, RuntimeConfig, Stage};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "foldrt",
    version,
    about = "Supervise a worker process and serve it over HTTP",
    long_about = None,
)]
struct Cli {
    /// Deployment stage: TEST or PROD. Anything else is local development,
    /// which keeps the runtime alive across crashes and enables watching.
    #[arg(long, env = "FOLD_STAGE")]
    stage: Option<String>,

    /// Directory whose changes restart the worker (local development only).
    #[arg(long = "watch-dir", env = "FOLD_WATCH_DIR", value_delimiter = ',')]
    watch_dirs: Vec<PathBuf>,

    /// Public HTTP listen address.
    #[arg(long, env = "FOLD_HTTP_ADDR", default_value = "0.0.0.0:6123")]
    http_addr: SocketAddr,

    /// What to do when the worker crashes: exit or keep-alive.
    #[arg(long, env = "FOLD_CRASH_POLICY")]
    crash_policy: Option<CrashPolicy>,

    /// Directory for worker sockets. Defaults to the OS temp dir.
    #[arg(long, env = "FOLD_SOCKET_DIR")]
    socket_dir: Option<PathBuf>,

    /// Seconds to wait for in-flight requests on shutdown.
    #[arg(long, env = "FOLD_DRAIN_TIMEOUT", default_value_t = 30)]
    drain_timeout: u64,

    /// Worker command followed by its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    fn stage(&self) -> Stage {
        Stage::from_env_value(self.stage.as_deref())
    }

    fn runtime_config(&self) -> Result<RuntimeConfig> {
        let (command, args) = self
            .command
            .split_first()
            .context("missing worker command")?;
        let stage = self.stage();

        let mut config = RuntimeConfig::new(command.clone(), args.to_vec());
        config.crash_policy = match (self.crash_policy, stage) {
            (Some(policy), _) => policy,
            (None, Stage::Dev) => CrashPolicy::KeepAlive,
            (None, _) => CrashPolicy::Exit,
        };
        if stage.is_dev() {
            config.watch_dirs = self.watch_dirs.clone();
        } else if !self.watch_dirs.is_empty() {
            tracing::warn!(stage = %stage, "ignoring watch dirs outside local development");
        }
        if let Some(dir) = &self.socket_dir {
            config.socket_dir = dir.clone();
        }
        config.drain_timeout = Duration::from_secs(self.drain_timeout);
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let stage = cli.stage();
    init_tracing(stage);

    let config = cli.runtime_config()?;
    tracing::info!(
        stage = %stage,
        command = %config.command,
        crash_policy = %config.crash_policy,
        http_addr = %cli.http_addr,
        "starting foldrt"
    );

    let drain_timeout = config.drain_timeout;
    let runtime = Runtime::builder(config)
        .build()
        .context("failed to build runtime")?;
    let server = HttpServer::bind(cli.http_addr)
        .await
        .context("failed to start http listener")?
        .with_drain_timeout(drain_timeout);
    let signals = forward_signals(runtime.clone()).context("failed to install signal handlers")?;
    let serving = tokio::spawn(server.serve(runtime.clone()));

    runtime.start().await;
    let reason = runtime.wait_done().await;
    tracing::info!(reason = %reason, "runtime finished");

    serving
        .await
        .context("http server task panicked")?
        .context("http server failed")?;
    signals.abort();
    reason.into_result().context("worker runtime exited")?;
    Ok(())
}
