use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cattle_storage::bridge::ExecBridge;
use cattle_storage::config::Config;
use cattle_storage::driver::VolumeDriver;
use cattle_storage::metrics::PluginMetrics;
use cattle_storage::mount::HostMounter;
use cattle_storage::reconciler::{GcTrigger, Reconciler};
use cattle_storage::server::{self, HealthState, PluginSocket, PluginState};
use cattle_storage::store::{CattleClient, VolumeStore};
use cattle_storage::supervisor::{Backoff, spawn_supervised};
use cattle_storage::tracker::{ContainerRuntime, ContainerTracker, DockerRuntime};

/// Volume plugin bridging the container runtime to Cattle-managed storage drivers.
#[derive(Parser, Debug)]
#[command(name = "cattle-storage", version)]
struct Cli {
    /// The volume driver name
    #[arg(long)]
    driver_name: String,

    /// Cattle API endpoint
    #[arg(long, env = "CATTLE_URL")]
    cattle_url: Option<String>,

    #[arg(long = "cattle-access-key", env = "CATTLE_ACCESS_KEY")]
    access_key: Option<String>,

    #[arg(long = "cattle-secret-key", env = "CATTLE_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Listen port for healthchecks; 0 disables them
    #[arg(long)]
    healthcheck_port: Option<u16>,

    #[arg(long, env = "DOCKER_HOST")]
    docker_host: Option<String>,

    /// External driver executable, if not the driver name on PATH
    #[arg(long)]
    command: Option<PathBuf>,

    /// Config file (json, toml or yaml)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        config.driver.name = self.driver_name;
        if let Some(url) = self.cattle_url {
            config.cattle.url = url;
        }
        if let Some(key) = self.access_key {
            config.cattle.access_key = key;
        }
        if let Some(key) = self.secret_key {
            config.cattle.secret_key = key;
        }
        if let Some(port) = self.healthcheck_port {
            config.health.port = port;
        }
        if let Some(host) = self.docker_host {
            config.docker.host = host;
        }
        if let Some(command) = self.command {
            config.driver.command = Some(command);
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cattle_storage=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    anyhow::ensure!(!config.driver.name.is_empty(), "--driver-name is required");

    tracing::info!(driver = %config.driver.name, "Starting");

    let docker = DockerRuntime::connect(&config.docker.host)?;
    docker.ping().await?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let cattle = CattleClient::new(&config.cattle).context("Failed to create Cattle client")?;
    let identity = cattle
        .resolve_identity(&config.driver.name, &config.cattle)
        .await
        .context("Failed to resolve storage driver identity")?;
    let store = VolumeStore::new(Arc::new(cattle), identity);

    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(PluginMetrics::new(registry)?);

    let trigger = GcTrigger::new();
    let driver = Arc::new(VolumeDriver::new(
        config.driver_settings(),
        Arc::new(ExecBridge::new(config.driver_command())),
        store,
        Arc::new(HostMounter::new()),
        trigger.clone(),
    ));
    driver.init().await.context("Failed to initialize")?;

    let tracker = Arc::new(ContainerTracker::new(driver.mount_root()));
    let reconciler = Arc::new(
        Reconciler::new(driver.clone(), tracker.clone(), trigger.clone(), config.gc_settings())
            .with_metrics(metrics.clone()),
    );

    // GC treats untracked mounts as drift, so the map must be populated first.
    tracker.resync(runtime.as_ref()).await.context("Failed to list running containers")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut tasks = Vec::new();
    {
        let (tracker, runtime) = (tracker.clone(), runtime.clone());
        let interval = Duration::from_secs(config.gc.resync_interval_secs);
        let token = shutdown.clone();
        tasks.push(spawn_supervised("resync", shutdown.clone(), Backoff::default(), move || {
            tracker.clone().resync_loop(runtime.clone(), interval, token.clone())
        }));
    }
    {
        let (tracker, runtime, trigger) = (tracker.clone(), runtime.clone(), trigger.clone());
        let token = shutdown.clone();
        let backoff = Backoff::fixed(Duration::from_secs(2));
        tasks.push(spawn_supervised("events", shutdown.clone(), backoff, move || {
            let (tracker, runtime, trigger, token) =
                (tracker.clone(), runtime.clone(), trigger.clone(), token.clone());
            async move { tracker.watch_events(runtime.as_ref(), &trigger, &token).await }
        }));
    }
    {
        let (reconciler, token) = (reconciler.clone(), shutdown.clone());
        tasks.push(spawn_supervised("gc", shutdown.clone(), Backoff::default(), move || {
            reconciler.clone().run(token.clone())
        }));
    }
    // A pass right after startup releases anything left mounted by a previous run.
    trigger.kick();

    if config.health.port > 0 {
        let state = HealthState { driver: driver.clone(), metrics: Some(metrics.clone()) };
        let (port, token) = (config.health.port, shutdown.clone());
        tasks.push(spawn_supervised("healthcheck", shutdown.clone(), Backoff::default(), move || {
            server::health::serve(port, state.clone(), token.clone())
        }));
    }

    let (socket, listener) = PluginSocket::bind(config.socket_path(), config.plugin_link())?;
    tracing::info!(driver = %config.driver.name, "Starting plugin");

    let state = PluginState { driver, reconciler, metrics: Some(metrics) };
    let served = server::serve_plugin(listener, state, shutdown.clone()).await;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task panicked");
        }
    }
    drop(socket);

    tracing::info!("Stopped");
    served
}
