use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use agenda::auth::StaffDirectory;
use agenda::config::Config;
use agenda::observability;
use agenda::tenant::TenantManager;
use agenda::wire::{self, AgendaFactory};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;
    let tls = agenda::tls::acceptor_for(&config)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let factory = Arc::new(AgendaFactory::new(
        Arc::new(TenantManager::new(
            config.data_dir.clone(),
            config.compact_threshold,
            config.engine,
        )),
        Arc::new(StaffDirectory::new(config.staff_users.iter().cloned())),
        config.password.clone(),
    ));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(
        "agenda listening on {addr} (data_dir={}, max_connections={}, scope_mode={:?}, utc_offset={}, staff={}, tls={})",
        config.data_dir.display(),
        config.max_connections,
        config.engine.scope_mode,
        config.engine.utc_offset,
        config.staff_users.len(),
        tls.is_some(),
    );

    let slots = Arc::new(Semaphore::new(config.max_connections));
    let shutdown = shutdown_signal()?;
    tokio::select! {
        () = serve(listener, factory, tls, Arc::clone(&slots)) => {}
        () = shutdown => info!("shutdown signal received, no longer accepting"),
    }

    drain(&slots, config.max_connections).await;
    info!("agenda stopped");
    Ok(())
}

/// Accept until the listener future is dropped. Over the connection cap, sockets are closed at once.
async fn serve(
    listener: TcpListener,
    factory: Arc<AgendaFactory>,
    tls: Option<TlsAcceptor>,
    slots: Arc<Semaphore>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("accept error: {e}");
                continue;
            }
        };
        let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
            warn!("at max connections, closing {peer}");
            metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        tracing::debug!("client connected from {peer}");
        metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
        let factory = Arc::clone(&factory);
        let tls = tls.clone();
        tokio::spawn(async move {
            if let Err(e) = wire::process_connection(socket, factory, tls).await {
                tracing::error!("connection from {peer} failed: {e}");
            }
            metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
            drop(permit);
        });
    }
}

/// Resolves on ctrl-c, or SIGTERM on unix.
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    Ok(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        #[cfg(not(unix))]
        let _ = tokio::signal::ctrl_c().await;
    })
}

/// Wait for open connections to hand back their permits, up to `DRAIN_TIMEOUT`.
async fn drain(slots: &Semaphore, max_connections: usize) {
    let open = max_connections - slots.available_permits();
    if open == 0 {
        return;
    }
    info!("waiting for {open} open connections");
    let all = u32::try_from(max_connections).unwrap_or(u32::MAX);
    match tokio::time::timeout(DRAIN_TIMEOUT, slots.acquire_many(all)).await {
        Ok(_) => info!("all connections closed"),
        Err(_) => warn!(
            "gave up after {DRAIN_TIMEOUT:?}, {} connections still open",
            max_connections - slots.available_permits()
        ),
    }
}
