use flux_server::config;
use flux_server::directory::PgDirectory;
use flux_server::hub::FluxHub;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tracing::info;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("FLUX_CONFIG").unwrap_or_else(|_| "flux.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let storage = flux_storage::connect(&config.postgres_dsn)
            .await
            .expect("storage");
        storage.migrate().await.expect("migrations");
        storage.readiness().await.expect("readiness");

        let directory = Arc::new(PgDirectory::new(Arc::new(storage)));
        let bind = config.bind.clone();
        let hub = FluxHub::new(config, directory);

        let state = hub.state();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = state.metrics.snapshot();
                info!(
                    connections = snapshot.connections_active,
                    ingress = snapshot.messages_ingress,
                    egress = snapshot.messages_egress,
                    relays = snapshot.relays_forwarded,
                    "hub stats"
                );
            }
        });

        let listener = TcpListener::bind(&bind).await.expect("bind");
        info!(address = %bind, "flux hub listening");
        hub.serve(listener).await.expect("serve");
    });
}
