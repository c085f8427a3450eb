//! Pipeline Enclave service binary
//!
//! Starts either role of the service:
//!
//! - **Coordinator**: binds the worker-manager port, accepts worker
//!   connections, and drives the named pipeline manifest to completion.
//! - **Worker**: connects to the coordinator, announces itself, and
//!   executes dispatched components one at a time.
//!
//! Configuration comes from `$APP_HOME/.conf/config.ini`; the transport
//! mode (plain, TLS, or RA-TLS) is chosen on the command line.

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};
use pipeline_enclave::attestation::{AttestationProvider, GramineAttestation, Measurements};
use pipeline_enclave::config::{Settings, DEFAULT_COORDINATOR_HOST, DEFAULT_COORDINATOR_PORT};
use pipeline_enclave::coordinator::Coordinator;
use pipeline_enclave::driver::TrialDriver;
use pipeline_enclave::error::Error;
use pipeline_enclave::runtime::ProcessRuntime;
use pipeline_enclave::scheduler::CachingScheduler;
use pipeline_enclave::store;
use pipeline_enclave::transport::{Acceptor, Connector, TransportMode};
use pipeline_enclave::worker::Worker;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "pipeline-enclave",
    about = "Attested pipeline execution service",
    group(ArgGroup::new("role").required(true).args(["coordinator", "worker"]))
)]
struct Cli {
    /// Start as coordinator
    #[arg(short = 'C', long)]
    coordinator: bool,

    /// Start as worker
    #[arg(short = 'W', long)]
    worker: bool,

    /// Worker ID (required for worker)
    #[arg(short = 'i', long)]
    id: Option<String>,

    /// Pipeline manifest name (required for coordinator)
    #[arg(short = 'm', long)]
    manifest: Option<String>,

    /// Coordinator host to connect (worker only)
    #[arg(short = 'H', long, default_value = DEFAULT_COORDINATOR_HOST)]
    coord_host: String,

    /// Coordinator port to connect (worker only)
    #[arg(short = 'P', long, default_value_t = DEFAULT_COORDINATOR_PORT)]
    coord_port: u16,

    /// Initial component key
    #[arg(short = 'k', long)]
    key: Option<String>,

    /// Transport mode
    #[arg(short = 'M', long, default_value = "plain")]
    mode: TransportMode,
}

/// Builds the attestation provider when RA-TLS is requested.
fn ratls_provider(
    mode: TransportMode,
    settings: &Settings,
) -> Result<Option<Arc<dyn AttestationProvider>>> {
    if mode != TransportMode::Ratls {
        return Ok(None);
    }
    if !settings.enable_ratls {
        warn!("RA-TLS mode requested but ratls.enable_ratls is off in config");
    }

    let (Some(mrenclave), Some(mrsigner)) = (&settings.mrenclave, &settings.mrsigner) else {
        bail!(Error::Config(
            "RA-TLS mode needs ratls.mrenclave and ratls.mrsigner".to_string()
        ));
    };
    let expected = Measurements::from_hex(mrenclave, mrsigner)?;
    Ok(Some(Arc::new(GramineAttestation::new(expected))))
}

async fn run_coordinator(cli: Cli, settings: Settings) -> Result<()> {
    let manifest_name = cli
        .manifest
        .clone()
        .context("a manifest must be specified to start the coordinator")?;

    if settings.storage_engine == store::LEDGEBASE_ENGINE {
        info!("Using ledgebase as storage engine");
        store::install_env(&settings)?;
    }

    let provider = ratls_provider(cli.mode, &settings)?;

    // The scheduler reports evictions from its own locked section; they
    // are forwarded onto the lifecycle domain through a channel.
    let (evict_tx, mut evict_rx) = mpsc::unbounded_channel::<String>();
    let scheduler = Arc::new(CachingScheduler::new(
        settings.scheduler_slots,
        settings.scheduler_compat_check,
        Box::new(move |id| {
            let _ = evict_tx.send(id.to_string());
        }),
    ));

    let coordinator = Coordinator::new(scheduler, cli.key.clone());

    let evictor = coordinator.clone();
    tokio::spawn(async move {
        while let Some(worker_id) = evict_rx.recv().await {
            evictor.on_cache_full(&worker_id).await;
        }
    });

    let listener = TcpListener::bind((
        settings.coordinator_host.as_str(),
        settings.worker_manager_port,
    ))
    .await
    .map_err(|e| {
        Error::Init(format!(
            "cannot bind {}:{}: {}",
            settings.coordinator_host, settings.worker_manager_port, e
        ))
    })?;

    let acceptor = Acceptor::new(cli.mode, &settings, provider)?;
    let accept_loop = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = accept_loop.run(listener, acceptor).await {
            error!(error = %e, "Accept loop stopped");
        }
    });

    let driver = TrialDriver::new(coordinator, settings.app_home.clone());
    driver.on_new_lifecycle(&manifest_name).await?;
    Ok(())
}

async fn run_worker(cli: Cli, settings: Settings) -> Result<()> {
    let id = cli.id.clone().context("a worker ID must be specified")?;

    let provider = ratls_provider(cli.mode, &settings)?;
    let connector = Connector::new(cli.mode, provider)?;

    let worker = Worker::new(id, Arc::new(ProcessRuntime::new()));
    let handler = worker
        .connect(&connector, &cli.coord_host, cli.coord_port)
        .await?;

    handler.wait_closed().await;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(mode = %cli.mode, "Message handler mode");
    info!(
        "Starting as {}",
        if cli.coordinator { "coordinator" } else { "worker" }
    );

    let settings = Settings::load()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.num_threads.max(1))
        .enable_all()
        .build()
        .context("cannot build I/O runtime")?;

    let result = if cli.coordinator {
        runtime.block_on(run_coordinator(cli, settings))
    } else {
        runtime.block_on(run_worker(cli, settings))
    };

    warn!("Bye");
    result
}
