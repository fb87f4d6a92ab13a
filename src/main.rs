use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use slotbook::auth::Directory;
use slotbook::clock::SystemClock;
use slotbook::config::Config;
use slotbook::engine::{Engine, EngineError};
use slotbook::notify::NotifyHub;
use slotbook::{observability, reaper, tls, wire};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Shared by every connection task.
#[derive(Clone)]
struct Shared {
    engine: Arc<Engine>,
    directory: Arc<Directory>,
    tls: Option<pgwire::tokio::TlsAcceptor>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    let acceptor = tls::load_tls_acceptor(config.tls_cert.as_deref(), config.tls_key.as_deref())?;
    let directory = Arc::new(match &config.users_file {
        Some(path) => Directory::load(path)?,
        None => Directory::single_client(config.password.clone()),
    });

    std::fs::create_dir_all(&config.data_dir)?;
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        Arc::new(NotifyHub::new()),
        config.engine,
        Arc::new(SystemClock),
    )?);

    // Provider accounts from the users file are bookable from the start.
    for record in directory.providers() {
        match engine.register_provider(record.id, record.name.clone()).await {
            Ok(_) | Err(EngineError::AlreadyExists(_)) => {}
            Err(e) => return Err(format!("registering provider {}: {e}", record.name).into()),
        }
    }

    tokio::spawn(reaper::run_reaper(engine.clone()));
    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(
        %addr,
        data_dir = %config.data_dir.display(),
        users = directory.len(),
        max_connections = config.max_connections,
        hold_seconds = config.engine.hold_seconds,
        timezone = %config.engine.default_timezone,
        tls = acceptor.is_some(),
        "slotbook listening"
    );

    let permits = Arc::new(Semaphore::new(config.max_connections));
    let shared = Shared {
        engine: engine.clone(),
        directory,
        tls: acceptor,
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => admit(socket, peer, &permits, &shared),
                Err(e) => error!("accept error: {e}"),
            },
            _ = &mut shutdown => {
                info!("shutdown signal received, no longer accepting");
                break;
            }
        }
    }

    drain(&permits, config.max_connections).await;

    // Holds left pending are released by the reaper after restart.
    engine.stop_all_hold_timers();
    info!("slotbook stopped");
    Ok(())
}

/// Spawn a task for the connection, or turn it away when every permit is taken.
fn admit(socket: TcpStream, peer: SocketAddr, permits: &Arc<Semaphore>, shared: &Shared) {
    let Ok(permit) = permits.clone().try_acquire_owned() else {
        warn!("connection limit reached, rejecting {peer}");
        metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
        return;
    };

    info!("connection from {peer}");
    metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);

    let shared = shared.clone();
    tokio::spawn(async move {
        let result =
            wire::process_connection(socket, shared.engine, shared.directory, shared.tls).await;
        if let Err(e) = result {
            error!("connection error from {peer}: {e}");
        }
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
        drop(permit);
    });
}

/// Resolves on ctrl-c, or SIGTERM where available.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Wait until every permit is back, giving up after `DRAIN_TIMEOUT`.
async fn drain(permits: &Semaphore, total: usize) {
    info!("draining connections");
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while permits.available_permits() < total {
        if tokio::time::Instant::now() >= deadline {
            let open = total - permits.available_permits();
            warn!("drain timeout, {open} connections still open");
            return;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    info!("all connections drained");
}
