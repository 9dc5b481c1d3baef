use clap::{Parser, Subcommand};
use coder2api::config::Config;
use coder2api::exec;
use coder2api::process::{BackendProcess, LaunchSpec, OutputMode};
use coder2api::proxy::ProxyServer;
use coder2api::supervisor::{Foreground, ShutdownSignals, Supervisor};
use coder2api::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "coder2api")]
#[command(about = "Run local coding-assistant APIs behind one path-prefix router", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file (built-in defaults when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every backend and the router (default)
    Serve {
        /// Run the router as a separate child process
        #[arg(long)]
        router_process: bool,
    },
    /// Run only the router
    Router,
    /// Run one backend's command in the foreground
    Exec {
        /// Backend name, e.g. gemini, chatmock, claude-code
        name: String,
        /// Arguments passed to the backend command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coder2api=debug".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let result = match cli.command.unwrap_or(Commands::Serve { router_process: false }) {
        Commands::Serve { router_process } => serve(config, cli.config, router_process).await,
        Commands::Router => router_only(config).await,
        Commands::Exec { name, args } => exec_backend(&config, &name, &args),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::from(1)
        }
    }
}

async fn serve(config: Config, config_path: Option<PathBuf>, router_process: bool) -> anyhow::Result<u8> {
    print_startup_banner(&config, router_process);

    let mut signals = ShutdownSignals::install()?;
    let supervisor = Supervisor::from_config(&config);

    if let Err(e) = supervisor.start_all(&config.backends).await {
        error!(error = %e, "Startup aborted");
        return Ok(1);
    }

    let foreground = if router_process {
        match spawn_router_process(&config, config_path) {
            Ok(process) => Foreground::Process(process),
            Err(e) => {
                error!(error = %e, "Failed to start router process");
                supervisor.shutdown().await;
                return Ok(1);
            }
        }
    } else {
        let server = match ProxyServer::from_config(&config, supervisor.subscribe()) {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "Invalid router configuration");
                supervisor.shutdown().await;
                return Ok(1);
            }
        };
        Foreground::in_process(server.run())
    };

    let exit = supervisor.run_foreground(foreground, &mut signals).await;
    info!(?exit, "Shutdown complete");
    Ok(exit.exit_code())
}

/// Start `<current exe> router` with the resolved ports in its environment
fn spawn_router_process(config: &Config, config_path: Option<PathBuf>) -> anyhow::Result<BackendProcess> {
    let exe = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("Failed to locate current executable: {}", e))?;

    let mut argv = vec![exe.to_string_lossy().into_owned()];
    if let Some(path) = config_path {
        argv.push("--config".to_string());
        argv.push(path.to_string_lossy().into_owned());
    }
    argv.push("router".to_string());

    let spec = LaunchSpec {
        name: "router".to_string(),
        argv,
        working_dir: None,
        env: config.router_env(),
    };
    Ok(BackendProcess::spawn(&spec, &OutputMode::Inherit)?)
}

async fn router_only(config: Config) -> anyhow::Result<u8> {
    let mut signals = ShutdownSignals::install()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::from_config(&config, shutdown_rx)?;
    info!(
        addr = %server.bind_addr(),
        routes = ?config.backends.iter().map(|b| format!("/{} -> 127.0.0.1:{}", b.prefix, b.port)).collect::<Vec<_>>(),
        "Starting router"
    );

    let mut handle = tokio::spawn(server.run());

    tokio::select! {
        result = &mut handle => {
            return match result {
                Ok(Ok(())) => Ok(0),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("Router task failed: {}", e)),
            };
        }
        signal = signals.recv() => {
            info!(signal, "Received signal, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
        warn!("Router did not stop in time");
    }
    Ok(0)
}

fn exec_backend(config: &Config, name: &str, args: &[String]) -> anyhow::Result<u8> {
    let backend = config.backend(name).ok_or_else(|| {
        let known: Vec<&str> = config.backends.iter().map(|b| b.name.as_str()).collect();
        anyhow::anyhow!("Unknown backend '{}' (configured: {})", name, known.join(", "))
    })?;

    let code = exec::delegate(backend, &config.project_root(), args)?;
    Ok(u8::try_from(code).unwrap_or(1))
}

fn print_startup_banner(config: &Config, router_process: bool) {
    info!(name = PKG_NAME, version = VERSION, "Starting");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        router_process,
        request_timeout_secs = config.server.request_timeout_secs,
        "Router configuration"
    );
    info!(
        log_dir = %config.log_dir().display(),
        root = %config.project_root().display(),
        shutdown_grace_period_secs = config.server.shutdown_grace_period_secs,
        "Supervisor configuration"
    );
    for backend in &config.backends {
        info!(
            name = %backend.name,
            prefix = %backend.prefix,
            port = backend.port,
            "Configured backend"
        );
    }
}
