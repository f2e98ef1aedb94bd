use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleet_core::{ChecksumIndex, FleetStore, SessionRegistry};
use fleet_crypto::keys::ServerKeys;
use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::connection;
use crate::dispatch::Dispatcher;
use crate::store::SqliteStore;

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let keys = Arc::new(ServerKeys::load_or_create(&config.state_dir)?);
    let store: Arc<dyn FleetStore> =
        Arc::new(SqliteStore::open(&config.state_dir).context("opening fleet store")?);
    let registry = Arc::new(SessionRegistry::new(
        keys,
        Arc::clone(&store),
        config.registry_config(),
    ));
    let index = Arc::new(
        ChecksumIndex::open(&config.fts_root, config.min_free_bytes, store)
            .context("opening checksum index")?,
    );

    // Reconcile the store with on-disk reality before serving traffic.
    {
        let index = Arc::clone(&index);
        tokio::task::spawn_blocking(move || index.reconcile())
            .await
            .context("reconcile task panicked")??;
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        index,
        config.allow_executable_update,
        config.allow_deployment,
    ));

    spawn_sweep(Arc::clone(&registry), config.sweep_interval_ms);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(
        addr = %config.listen_addr,
        server_id = %registry.server_id(),
        "fleet server listening"
    );

    tokio::select! {
        result = accept_loop(listener, dispatcher) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            connection::handle_client(stream, dispatcher, peer.ip().to_string()).await;
        });
    }
}

/// Periodic expiry sweep. Each pass runs on a blocking thread so the
/// store mirroring inside eviction never stalls the timer.
fn spawn_sweep(registry: Arc<SessionRegistry>, interval_ms: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            ticker.tick().await;
            let registry = Arc::clone(&registry);
            let _ = tokio::task::spawn_blocking(move || registry.sweep_at(fleet_core::now_ms()))
                .await;
        }
    });
}
