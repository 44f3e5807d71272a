#![doc = include_str!("../README.md")]

mod server;

use anyhow::Context;
use casebook_wire::{
    casebook::{Ledger, LedgerOptions, Tracking},
    tls,
};
use clap::Parser;
use server::{
    config::{CliArgs, ServerConfig, StaleSweep, TlsFiles},
    listener::serve_clients,
    status::serve_status,
    telemetry::init_telemetry,
};
use std::{fs::OpenOptions, path::Path, sync::Arc};
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

// mimalloc holds up better than the system allocator under many concurrent
// sessions, especially on musl.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let ledger = open_ledger(&config)?;
    info!(stats = %ledger.stats(), "ledger opened");
    let db = Arc::new(Tracking::new(ledger.clone(), config.lease_timeout));

    let acceptor = config.tls.as_ref().map(tls_acceptor).transpose()?;
    let clients = TcpListener::bind(&config.client_addr)
        .await
        .with_context(|| format!("cannot bind client listener on {}", config.client_addr))?;
    let status = TcpListener::bind(&config.status_addr)
        .await
        .with_context(|| format!("cannot bind status listener on {}", config.status_addr))?;

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = vec![
        tokio::spawn(serve_status(status, shutdown.clone())),
        tokio::spawn(serve_clients(
            clients,
            acceptor,
            db,
            config.session,
            shutdown.clone(),
            config.shutdown_grace,
        )),
    ];
    if let Some(sweep) = config.stale_sweep {
        tasks.push(tokio::spawn(sweep_stale(
            ledger.clone(),
            sweep,
            shutdown.clone(),
        )));
    }

    shutdown_signal().await;
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "server task panicked");
        }
    }

    ledger.flush().context("cannot flush ledger")?;
    info!(stats = %ledger.stats(), "ledger flushed, shut down");
    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        info!("Starting ledger server with full config: {:#?}", config);
    } else {
        info!(
            ledger = %config.ledger.display(),
            client_addr = %config.client_addr,
            status_addr = %config.status_addr,
            lease_minutes = config.lease_timeout.as_secs() / 60,
            tls = config.tls.is_some(),
            "Starting ledger server"
        );
    }
}

fn open_ledger(config: &ServerConfig) -> anyhow::Result<Ledger> {
    let append = |path: &Path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log {}", path.display()))
    };

    let mut options = LedgerOptions::new().with_pool_capacity(config.pool_capacity);
    if let Some(path) = config.duplicate_log.as_deref() {
        options = options.with_duplicate_log(append(path)?);
    }
    if let Some(path) = config.solver_log.as_deref() {
        options = options.with_solver_log(append(path)?);
    }
    options
        .open(&config.ledger)
        .with_context(|| format!("cannot open ledger {}", config.ledger.display()))
}

fn tls_acceptor(files: &TlsFiles) -> anyhow::Result<TlsAcceptor> {
    let certs = tls::load_certs(&files.cert).context("cannot load server certificate")?;
    let key = tls::load_private_key(&files.key).context("cannot load server key")?;
    let roots = tls::load_roots(&files.client_ca).context("cannot load client CA bundle")?;
    Ok(TlsAcceptor::from(tls::server_config(certs, key, roots)?))
}

/// Backstop for claims that no lease tracks anymore, e.g. ones made before
/// a restart.
async fn sweep_stale(ledger: Ledger, sweep: StaleSweep, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(sweep.interval);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let released = ledger.reclaim_stale(sweep.window);
                debug!(released, "stale sweep done");
            }
            () = shutdown.cancelled() => break,
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
    info!("Shutdown signal received, terminating gracefully...");
}
