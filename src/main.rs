use axum::{serve, Router};
use clap::Parser;
use gpuwatchd::collectors::fake::FakeProvider;
use gpuwatchd::collectors::nvidia_smi::NvidiaSmiProvider;
use gpuwatchd::collectors::DeviceProvider;
use gpuwatchd::config::Config;
use gpuwatchd::error::SamplerError;
use gpuwatchd::http;
use gpuwatchd::metrics::Metrics;
use gpuwatchd::pipeline::Pipeline;
use gpuwatchd::registry::ConsumerRegistry;
use gpuwatchd::renderer::Renderer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpuwatchd")]
#[command(version)]
struct Cli {
    /// YAML config file; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
    /// Stream snapshots over WebSocket instead of drawing the terminal view.
    #[arg(long)]
    web: bool,
    #[arg(long)]
    listen: Option<String>,
    /// Sampling period, e.g. `500ms` or `2s`.
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,
    /// Sample a synthetic device instead of a real GPU.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let mut cfg = match &cli.config {
        Some(path) => match Config::load_from_file(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                error!(error = %err, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(listen) = cli.listen.clone() {
        cfg.listen = listen;
    }
    if let Some(interval) = cli.interval {
        cfg.interval_ms = interval.as_millis() as u64;
    }
    if let Err(err) = cfg.validate() {
        error!(error = %err, "invalid configuration");
        std::process::exit(1);
    }

    let provider: Box<dyn DeviceProvider> = if cli.demo {
        Box::new(FakeProvider::synthetic())
    } else {
        Box::new(
            NvidiaSmiProvider::new(cfg.nvidia_smi_path.clone())
                .with_timeout(cfg.command_timeout()),
        )
    };

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(cfg, provider, metrics, cli.web).await {
        error!(error = %err, "gpuwatchd failed");
        std::process::exit(1);
    }
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error(transparent)]
    Bind(#[from] http::BindError),
    #[error("HTTP server stopped: {0}")]
    Server(String),
}

async fn run(
    cfg: Config,
    provider: Box<dyn DeviceProvider>,
    metrics: Arc<Metrics>,
    web: bool,
) -> Result<(), RunError> {
    info!(
        interval_ms = cfg.interval_ms,
        device_index = cfg.device_index,
        web,
        "starting gpuwatchd"
    );

    // Bind before the sampler starts.
    let listener = if web {
        let listener = http::bind(&cfg.listen).await?;
        info!(listen = %cfg.listen, "WebSocket stream available at /ws");
        Some(listener)
    } else {
        None
    };

    let mut pipeline = Pipeline::start(
        provider,
        cfg.sampler(),
        cfg.consumer_buffer_capacity,
        metrics.clone(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumer_tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut server_task = None;
    match listener {
        Some(listener) => {
            let registry = ConsumerRegistry::new(cfg.consumer_buffer_capacity, metrics.clone());
            let stream = pipeline.subscribe();
            let relay = registry.clone();
            consumer_tasks.push(tokio::spawn(async move { relay.run(stream).await }));
            server_task = Some(spawn_http(
                listener,
                http::build_router(metrics, registry, cfg.send_timeout()),
                shutdown_rx,
            ));
        }
        None => {
            let stream = pipeline.subscribe();
            consumer_tasks.push(tokio::spawn(async move {
                Renderer::new(std::io::stdout()).run(stream).await;
            }));
        }
    }

    let outcome = tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, stopping");
            Ok(())
        }
        reason = server_exit(&mut server_task) => Err(RunError::Server(reason)),
    };

    pipeline.stop().await;
    let _ = shutdown_tx.send(true);
    if let Some(task) = server_task {
        let _ = task.await;
    }
    for task in consumer_tasks {
        let _ = task.await;
    }
    outcome
}

fn spawn_http(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
    })
}

/// Resolves when the HTTP server ends on its own; pends forever in terminal mode.
async fn server_exit(task: &mut Option<JoinHandle<std::io::Result<()>>>) -> String {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let reason = match handle.await {
        Ok(Ok(())) => "server exited".to_string(),
        Ok(Err(err)) => err.to_string(),
        Err(err) => format!("server task failed: {err}"),
    };
    *task = None;
    reason
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
