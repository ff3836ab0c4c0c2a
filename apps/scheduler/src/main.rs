//! Lattice scheduler daemon.

mod handlers;
mod rest;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use lattice_config::SchedulerConfig;
use lattice_dispatch::Dispatcher;
use lattice_engine::{
    InMemoryCatalog, InMemoryGrantStore, InMemoryResourceProvider, ResourceBinder, RunRegistry,
};
use lattice_events::{BroadcastSink, EventBus};
use lattice_session::{ControlPlaneServer, InstanceIndex, SessionTokens, WorkerGateway, WorkerRegistry};
use tracing_subscriber::EnvFilter;

use handlers::SchedulerHandlers;
use rest::RestState;

/// Scheduler control plane and run engine.
#[derive(Debug, Parser)]
#[command(name = "lattice-scheduler", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "LATTICE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address.
    #[arg(long)]
    bind: Option<String>,

    /// Path of the persisted worker instance index.
    #[arg(long, env = "LATTICE_INSTANCE_INDEX", default_value = "lattice-instances.json")]
    instance_index: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = SchedulerConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    let scheduler_id = format!("scheduler-{}", uuid::Uuid::new_v4());
    tracing::info!(%scheduler_id, bind = %config.server.bind_addr, "starting scheduler");

    let bus = Arc::new(EventBus::new(1024));
    let sink = Arc::new(BroadcastSink::new(Arc::clone(&bus)));

    let binder = Arc::new(ResourceBinder::new(
        Arc::new(InMemoryCatalog::default()),
        Arc::new(InMemoryGrantStore::default()),
        Arc::new(InMemoryResourceProvider::default()),
        config.resource.max_inline_bytes,
    ));
    let registry = Arc::new(RunRegistry::new(sink.clone()).with_binder(binder));

    let worker_registry = Arc::new(WorkerRegistry::new(
        InstanceIndex::load(args.instance_index),
        config.session.resume_grace_seconds,
    ));
    let gateway = WorkerGateway::new(Arc::clone(&worker_registry), scheduler_id.clone());
    let dispatcher = Arc::new(Dispatcher::start(
        Arc::clone(&registry),
        Arc::new(gateway.clone()),
        config.dispatch.clone(),
    ));

    let handler = Arc::new(SchedulerHandlers::new(
        Arc::clone(&registry),
        Arc::clone(&dispatcher),
        gateway.clone(),
    ));
    let _expired_poller = handler.spawn_expired_next_poller();

    let tokens = match &config.server.session_secret {
        Some(secret) => Arc::new(SessionTokens::new(secret.clone().into_bytes())),
        None => Arc::new(SessionTokens::ephemeral()),
    };
    let server = Arc::new(ControlPlaneServer::new(
        worker_registry,
        tokens,
        config.clone(),
        sink,
        handler,
        scheduler_id,
    ));
    let _reaper = server.spawn_grace_reaper();

    let rest_state = RestState {
        registry,
        dispatcher,
        gateway,
        tenant: "default".to_owned(),
    };
    let app = Arc::clone(&server).router().merge(rest::router(rest_state));

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.server.bind_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("serving")?;
    Ok(())
}
