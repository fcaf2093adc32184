//! Harvest binary entry point.
//!
//! Parses the command line, loads the plugin configuration, sizes the
//! runtime and supervises the agent until a termination signal arrives.

use std::io::{IsTerminal, Write};
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harvest::agent::{Agent, AgentError, Config};
use harvest::apiwriter::shared_output;
use harvest::cli::Cli;
use harvest::module::{Registry, example};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    // Logs go to stderr; stdout belongs to the output protocol.
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let out = shared_output(std::io::stdout());

    let agent = match Agent::setup(Config {
        name: "harvest".to_string(),
        registry: default_registry(),
        out: out.clone(),
        conf_dirs: cli.config,
        use_module: cli.modules,
        min_update_every: cli.update_every.unwrap_or(0),
        keep_alive: !std::io::stdout().is_terminal(),
    }) {
        Ok(agent) => agent,
        Err(AgentError::Disabled) => {
            tracing::info!("disabled in the configuration file");
            let mut out = out.lock().unwrap_or_else(|e| e.into_inner());
            let _ = writeln!(out, "DISABLE");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            tracing::error!(error = %e, "setup failed");
            return ExitCode::FAILURE;
        }
    };

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if agent.max_procs() > 0 {
        builder.worker_threads(agent.max_procs());
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "building the runtime failed");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        let token = CancellationToken::new();
        tokio::spawn(handle_signals(token.clone()));
        agent.run(token).await;
    });

    ExitCode::SUCCESS
}

fn default_registry() -> Registry {
    let mut registry = Registry::default();
    registry.register("example", example::creator());
    registry
}

/// SIGINT/SIGTERM/SIGHUP cancel the root token for a graceful drain;
/// SIGPIPE means the host is gone and exits immediately.
async fn handle_signals(token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "installing signal handler failed");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "installing signal handler failed");
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "installing signal handler failed");
            return;
        }
    };
    let mut pipe = match signal(SignalKind::pipe()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "installing signal handler failed");
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => tracing::info!("received SIGINT, terminating"),
        _ = terminate.recv() => tracing::info!("received SIGTERM, terminating"),
        _ = hangup.recv() => tracing::info!("received SIGHUP, terminating"),
        _ = pipe.recv() => {
            tracing::info!("received SIGPIPE, exiting");
            std::process::exit(1);
        }
    }
    token.cancel();
}
