//! Reference host process for Nuvom: loads plugins, builds the configured
//! backends, registers tasks, and runs the worker pool until a termination
//! signal arrives.
use nuvom_core::config::Config;
use nuvom_core::plugin::PluginRegistry;
use nuvom_core::pool::WorkerPool;
use nuvom_core::queue::{FileQueue, MemoryQueue, QueueBackend, SqliteQueue};
use nuvom_core::result::{FileResultBackend, MemoryResultBackend, ResultBackend, SqliteResultBackend};
use nuvom_core::runner::JobRunner;
use nuvom_core::task::TaskRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::new()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    info!("Starting nuvom-worker in \"{}\" environment", config.environment);

    let exporter_builder = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.prometheus_port));
    if let Err(e) = exporter_builder.install() {
        error!("Failed to install Prometheus exporter: {}", e);
    }
    nuvom_core::metrics::install_descriptions();

    let mut plugins = match PluginRegistry::load(&config.plugin_descriptor_path) {
        Ok(plugins) => plugins,
        Err(e) => {
            error!("Fatal: plugin load failed: {}", e);
            std::process::exit(1);
        }
    };

    let tasks = Arc::new(build_task_registry(&config)?);

    let queue = match build_queue_backend(&config, &plugins).await {
        Ok(queue) => queue,
        Err(e) => {
            error!("Fatal: failed to construct queue backend \"{}\": {}", config.queue_backend, e);
            std::process::exit(1);
        }
    };
    let results = match build_result_backend(&config, &plugins).await {
        Ok(results) => results,
        Err(e) => {
            error!("Fatal: failed to construct result backend \"{}\": {}", config.result_backend, e);
            std::process::exit(1);
        }
    };

    let runner = Arc::new(JobRunner::new(Arc::clone(&tasks), Arc::clone(&queue), results));
    let pool = WorkerPool::new(&config, runner, queue);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = tokio::spawn(wait_for_termination(shutdown_tx));

    let run_result = pool.run(shutdown_rx, &mut plugins).await;
    signal_task.abort();

    match run_result {
        Ok(()) => {
            info!("nuvom-worker exited cleanly");
            Ok(())
        }
        Err(e) => {
            error!("nuvom-worker exited with an error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Waits for SIGINT, SIGTERM, or SIGQUIT and flips the shutdown watch.
async fn wait_for_termination(shutdown_tx: watch::Sender<bool>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigquit.recv() => info!("Received SIGQUIT"),
    }
    let _ = shutdown_tx.send(true);
}

/// Populates the task registry from the configured manifest, if any.
/// Hosts that build their task set programmatically (builder calls at
/// startup rather than a manifest file) call [`TaskRegistry::register`]
/// directly instead of going through this path.
fn build_task_registry(config: &Config) -> nuvom_core::Result<TaskRegistry> {
    let registry = TaskRegistry::new();
    if let Some(_manifest_path) = &config.manifest_path {
        // Manifest-driven task discovery is an external collaborator
        // (§1 Out of scope): the host process is expected to have already
        // registered callables built from that manifest before this point
        // in a real deployment. Left empty here since this binary is the
        // generic reference host, not a specific task-bearing application.
    }
    Ok(registry)
}

async fn build_queue_backend(
    config: &Config,
    plugins: &PluginRegistry,
) -> nuvom_core::Result<Arc<dyn QueueBackend>> {
    let visibility_timeout = Duration::from_secs(config.visibility_timeout_secs);
    match config.queue_backend.as_str() {
        "memory" => Ok(Arc::new(MemoryQueue::default())),
        "file" => {
            let queue = Arc::new(FileQueue::new(&config.file_queue_path, visibility_timeout).await?);
            queue.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs));
            Ok(queue)
        }
        "sqlite" => {
            let queue = Arc::new(SqliteQueue::new(&config.sqlite_queue_path, visibility_timeout)?);
            queue.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs));
            Ok(queue)
        }
        other => match plugins.context().queue_factory(other) {
            Some(factory) => factory(),
            None => Err(nuvom_core::NuvomError::PluginLoadError(format!(
                "no queue backend named \"{other}\" (built-in or plugin-provided)"
            ))),
        },
    }
}

async fn build_result_backend(
    config: &Config,
    plugins: &PluginRegistry,
) -> nuvom_core::Result<Arc<dyn ResultBackend>> {
    match config.result_backend.as_str() {
        "memory" => Ok(Arc::new(MemoryResultBackend::new())),
        "file" => Ok(Arc::new(FileResultBackend::new(&config.file_result_path).await?)),
        "sqlite" => Ok(Arc::new(SqliteResultBackend::new(&config.sqlite_result_path)?)),
        other => match plugins.context().result_factory(other) {
            Some(factory) => factory(),
            None => Err(nuvom_core::NuvomError::PluginLoadError(format!(
                "no result backend named \"{other}\" (built-in or plugin-provided)"
            ))),
        },
    }
}
