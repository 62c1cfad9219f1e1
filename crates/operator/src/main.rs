use clap::{Parser, Subcommand, ValueEnum};
use kube::CustomResourceExt;
use pgwarden_core::config;
use pgwarden_operator::api::create_router;
use pgwarden_operator::api::handlers::AppState;
use pgwarden_operator::instance::{HttpInstanceClient, InstanceClient};
use pgwarden_operator::scheduler::{Scheduler, SchedulerConfig};
use pgwarden_operator::store::kubernetes::{ClusterResource, KubeStore};
use pgwarden_operator::store::memory::MemoryStore;
use pgwarden_operator::store::ObjectStore;
use pgwarden_operator::{ClusterReconciler, ReconcilerConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreBackend {
    /// Kubernetes API of the current kubeconfig / in-cluster service account
    Kube,
    /// In-process store, for demos
    Memory,
}

#[derive(Subcommand)]
enum Command {
    /// Print the Cluster custom resource definition as JSON and exit
    Crd,
}

#[derive(Parser)]
#[command(name = "pgwarden", about = "Failover and adoption operator for PostgreSQL clusters")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Namespace to watch
    #[arg(long, env = "PGWARDEN_NAMESPACE", default_value = config::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Object store backend
    #[arg(long, env = "PGWARDEN_STORE", value_enum, default_value_t = StoreBackend::Kube)]
    store: StoreBackend,

    /// Number of reconcile workers
    #[arg(long, env = "PGWARDEN_WORKERS", default_value_t = config::DEFAULT_WORKERS)]
    workers: usize,

    /// Admin API port
    #[arg(short, long, env = "PGWARDEN_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Instance manager port on every database pod
    #[arg(long, env = "PGWARDEN_INSTANCE_PORT", default_value_t = config::DEFAULT_INSTANCE_PORT)]
    instance_port: u16,

    /// Health probe timeout in seconds
    #[arg(long, env = "PGWARDEN_PROBE_TIMEOUT", default_value_t = config::DEFAULT_PROBE_TIMEOUT_SECS)]
    probe_timeout: u64,

    /// Seconds the primary may be unready before failover starts
    #[arg(long, env = "PGWARDEN_PRIMARY_GRACE", default_value_t = config::DEFAULT_PRIMARY_GRACE_SECS)]
    primary_grace: u64,

    /// Seconds without an eligible standby before a failover is reported stalled
    #[arg(long, env = "PGWARDEN_FAILOVER_TIMEOUT", default_value_t = config::DEFAULT_FAILOVER_TIMEOUT_SECS)]
    failover_timeout: u64,

    /// Full resync interval in seconds
    #[arg(long, env = "PGWARDEN_RESYNC_INTERVAL", default_value_t = config::DEFAULT_RESYNC_INTERVAL_SECS)]
    resync_interval: u64,

    /// Graceful shutdown timeout in seconds
    #[arg(long, env = "PGWARDEN_SHUTDOWN_TIMEOUT", default_value_t = config::DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(Command::Crd) = args.command {
        println!("{}", serde_json::to_string_pretty(&ClusterResource::crd())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(
                    "pgwarden_operator=info"
                        .parse()
                        .expect("valid directive literal"),
                )
                .add_directive("pgwarden_core=info".parse().expect("valid directive literal")),
        )
        .init();

    if args.port == 0 {
        eprintln!("Error: port must be > 0");
        std::process::exit(1);
    }
    if args.workers == 0 {
        eprintln!("Error: workers must be > 0");
        std::process::exit(1);
    }

    let store: Arc<dyn ObjectStore> = match args.store {
        StoreBackend::Kube => {
            let client = kube::Client::try_default().await?;
            Arc::new(KubeStore::new(client, &args.namespace, args.instance_port))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store, state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let probe_timeout = Duration::from_secs(args.probe_timeout);
    let instances: Arc<dyn InstanceClient> =
        Arc::new(HttpInstanceClient::new(args.instance_port, probe_timeout)?);

    let reconciler = ClusterReconciler::new(
        Arc::clone(&store),
        instances,
        ReconcilerConfig {
            probe_timeout,
            primary_grace: Duration::from_secs(args.primary_grace),
            failover_timeout: Duration::from_secs(args.failover_timeout),
            ..Default::default()
        },
    );
    let scheduler = Scheduler::new(
        Arc::new(reconciler),
        Arc::clone(&store),
        SchedulerConfig {
            workers: args.workers,
            resync_interval: Duration::from_secs(args.resync_interval),
            ..Default::default()
        },
    );

    let prometheus_handle =
        metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let state = AppState {
        store: Arc::clone(&store),
        queue: Arc::clone(scheduler.queue()),
        prometheus_handle,
        start_time: Instant::now(),
    };
    let app = create_router(state);
    let addr = format!("0.0.0.0:{}", args.port);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        namespace = %args.namespace,
        store = ?args.store,
        workers = args.workers,
        primary_grace_secs = args.primary_grace,
        "pgwarden ready"
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await?;

    // Let running reconciles finish their current cycle.
    let _ = shutdown_tx.send(true);
    let deadline = Duration::from_secs(args.shutdown_timeout);
    match tokio::time::timeout(deadline, scheduler_task).await {
        Ok(_) => tracing::info!("Scheduler drained"),
        Err(_) => tracing::error!(
            "Shutdown timeout ({}s) exceeded with reconciles still running",
            args.shutdown_timeout
        ),
    }

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    tracing::info!("Shutting down gracefully, draining in-flight requests...");
}
