//! `ldr`: render farm server and render client.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ldr::transport::{ServerConfig, serve};
use ldr::{
    ClientConfig, FarmConfig, FarmControl, FileInfo, FrameRangeSource, QueueSource, RenderJob,
    RendererConfig, Thresholds, run_client, spawn_farm,
};

#[derive(Debug, Parser)]
#[command(name = "ldr", version, about = "Distributed render farm dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dispatch frames to local renderers and remote render clients.
    Server(ServerArgs),
    /// Render tasks for a server.
    Client(ClientArgs),
}

#[derive(Debug, Args)]
struct RendererArgs {
    /// Renderer executable.
    #[arg(long)]
    renderer: Option<PathBuf>,

    /// Argument passed to the renderer before the task's own arguments.
    #[arg(long = "renderer-arg", allow_hyphen_values = true)]
    renderer_args: Vec<String>,
}

impl RendererArgs {
    fn apply(self, current: Option<RendererConfig>) -> Option<RendererConfig> {
        let renderer = match (self.renderer, current) {
            (Some(program), Some(current)) => RendererConfig::new(program).with_args(current.args),
            (Some(program), None) => RendererConfig::new(program),
            (None, current) => current?,
        };
        if self.renderer_args.is_empty() {
            Some(renderer)
        } else {
            Some(renderer.with_args(self.renderer_args))
        }
    }
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to accept render clients on.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Do not accept render clients.
    #[arg(long, conflicts_with = "listen")]
    no_listen: bool,

    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    low: Option<usize>,

    #[arg(long)]
    high: Option<usize>,

    #[command(flatten)]
    renderer: RendererArgs,

    /// Maximum concurrent local renders.
    #[arg(long)]
    local_workers: Option<usize>,

    /// Job slots granted to each render client.
    #[arg(long)]
    njobs: Option<u16>,

    /// Render client to connect out to (repeatable).
    #[arg(long)]
    connect: Vec<String>,

    /// Directory task input files are relative to.
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Operator HTTP API address.
    #[arg(long)]
    http: Option<SocketAddr>,

    #[command(flatten)]
    job: JobArgs,
}

#[derive(Debug, Args)]
struct JobArgs {
    /// First frame to render. Without it the server waits for tasks over HTTP.
    #[arg(long)]
    first: Option<u32>,

    /// Last frame to render (defaults to --first).
    #[arg(long, requires = "first")]
    last: Option<u32>,

    #[arg(long, default_value_t = 640)]
    width: u16,

    #[arg(long, default_value_t = 480)]
    height: u16,

    #[arg(long, default_value = "png")]
    format: String,

    /// Input file, relative to the input directory (repeatable).
    #[arg(long = "file")]
    files: Vec<PathBuf>,

    /// Extra renderer argument for every frame (repeatable).
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Per-frame timeout in seconds.
    #[arg(long)]
    timeout: Option<f64>,
}

#[derive(Debug, Args)]
struct ClientArgs {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server to connect to.
    #[arg(long)]
    server: Option<String>,

    /// Wait for servers on this address instead.
    #[arg(long, conflicts_with = "server")]
    listen: Option<SocketAddr>,

    #[arg(long)]
    password: Option<String>,

    #[command(flatten)]
    renderer: RendererArgs,

    /// Input file cache and render output directory.
    #[arg(long)]
    work_dir: Option<PathBuf>,
}

/// Initialize tracing with LDR_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("LDR_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("ldr={level},ldr_farm={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    match Cli::parse().command {
        Command::Server(args) => run_server(args).await,
        Command::Client(args) => run_render_client(args).await,
    }
}

fn farm_config(args: &mut ServerArgs) -> Result<FarmConfig> {
    let mut config = match &args.config {
        Some(path) => FarmConfig::from_file(path)?,
        None => FarmConfig::new(),
    };
    config = config.apply_env()?;

    if args.no_listen {
        config.listen = None;
    } else if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }
    if let Some(password) = args.password.take() {
        config.password = Some(password);
    }
    let thresholds = Thresholds {
        low: args.low.unwrap_or(config.thresholds.low),
        high: args.high.unwrap_or(config.thresholds.high),
    };
    config.thresholds = thresholds;
    if args.local_workers.is_some() {
        config.local_workers = args.local_workers;
    }
    if let Some(njobs) = args.njobs {
        config.client_njobs = njobs;
    }
    if !args.connect.is_empty() {
        config.connect = std::mem::take(&mut args.connect);
    }
    if let Some(dir) = args.input_dir.take() {
        config.input_dir = dir;
    }
    if args.http.is_some() {
        config.http = args.http;
    }
    let renderer = RendererArgs {
        renderer: args.renderer.renderer.take(),
        renderer_args: std::mem::take(&mut args.renderer.renderer_args),
    };
    config.renderer = renderer.apply(config.renderer.take());

    config.validate()?;
    Ok(config)
}

fn render_job(job: &JobArgs, input_dir: &std::path::Path) -> Result<RenderJob> {
    let files = job
        .files
        .iter()
        .map(|path| {
            FileInfo::from_path(input_dir, path.clone())
                .with_context(|| format!("cannot stat input file {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    let timeout = job
        .timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("invalid --timeout")?;
    Ok(RenderJob {
        width: job.width,
        height: job.height,
        oformat: job.format.clone(),
        files,
        args: job.args.clone(),
        timeout,
    })
}

async fn run_server(mut args: ServerArgs) -> Result<()> {
    let config = farm_config(&mut args).context("invalid server configuration")?;
    let http = config.http;

    let (farm, completion) = match args.job.first {
        Some(first) => {
            let last = args.job.last.unwrap_or(first);
            let job = render_job(&args.job, &config.input_dir)?;
            let mut source = FrameRangeSource::new(job, first, last);
            let completion = source.completion();
            info!(first, last, "Rendering frame range");
            (spawn_farm(config, source).await?, Some(completion))
        }
        None => (spawn_farm(config, QueueSource::new()).await?, None),
    };
    if let Some(addr) = farm.local_addr() {
        info!(%addr, "Accepting render clients");
    }
    let farm = Arc::new(farm);

    let api = http.map(|addr| {
        let control: Arc<dyn FarmControl> = farm.clone();
        tokio::spawn(serve(ServerConfig::from(addr), control))
    });

    let finished = async {
        match completion {
            Some(rx) => rx.await.ok(),
            None => std::future::pending().await,
        }
    };
    let api_stopped = async {
        match api {
            Some(handle) => match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Operator API failed"),
                Err(e) => tracing::error!(error = %e, "Operator API task panicked"),
            },
            None => std::future::pending().await,
        }
    };

    let summary = tokio::select! {
        summary = finished => summary,
        _ = api_stopped => None,
        _ = shutdown_requested() => None,
    };

    let killed = farm
        .terminate_all("server shutting down".to_string())
        .await?;
    if killed > 0 {
        tracing::warn!(killed, "Force-killed tasks on shutdown");
    }
    farm.shutdown().await?;

    if let Some(summary) = summary {
        println!("{}", serde_json::to_string(&summary)?);
        if !summary.failed.is_empty() {
            anyhow::bail!("{} frame(s) failed", summary.failed.len());
        }
    }
    Ok(())
}

async fn run_render_client(args: ClientArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::new(),
    };
    config = config.apply_env()?;
    if let Some(server) = args.server {
        config.server = Some(server);
    }
    if let Some(listen) = args.listen {
        config.server = None;
        config.listen = Some(listen);
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    if let Some(dir) = args.work_dir {
        config.work_dir = dir;
    }
    config.renderer = args.renderer.apply(config.renderer.take());

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_requested().await;
        token.cancel();
    });

    let summary = run_client(config, shutdown)
        .await
        .context("render client failed")?;
    info!(
        rendered = summary.rendered,
        failed = summary.failed,
        refused = summary.refused,
        "Render client stopped"
    );
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed, which only happens when the
/// tokio runtime is misconfigured.
async fn shutdown_requested() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn server_flags_override_defaults() {
        let cli = Cli::parse_from([
            "ldr",
            "server",
            "--no-listen",
            "--renderer",
            "/usr/bin/povray",
            "--renderer-arg",
            "-D",
            "--low",
            "1",
            "--high",
            "3",
            "--first",
            "1",
            "--last",
            "10",
        ]);
        let Command::Server(mut args) = cli.command else {
            panic!("expected server subcommand");
        };
        let config = farm_config(&mut args).unwrap();
        assert!(config.listen.is_none());
        assert_eq!(config.thresholds, Thresholds { low: 1, high: 3 });
        let renderer = config.renderer.unwrap();
        assert_eq!(renderer.program, PathBuf::from("/usr/bin/povray"));
        assert_eq!(renderer.args, vec!["-D".to_string()]);
        assert_eq!(args.job.last, Some(10));
    }

    #[test]
    fn listener_without_password_rejected() {
        let cli = Cli::parse_from(["ldr", "server", "--listen", "127.0.0.1:3104"]);
        let Command::Server(mut args) = cli.command else {
            panic!("expected server subcommand");
        };
        // LDR_PASSWORD from the test environment would mask the check.
        if std::env::var("LDR_PASSWORD").is_err() {
            assert!(farm_config(&mut args).is_err());
        }
    }

    #[test]
    fn client_listen_replaces_server() {
        let cli = Cli::parse_from(["ldr", "client", "--listen", "0.0.0.0:3104"]);
        let Command::Client(args) = cli.command else {
            panic!("expected client subcommand");
        };
        assert_eq!(args.listen, Some("0.0.0.0:3104".parse().unwrap()));
        assert!(args.server.is_none());
    }
}
