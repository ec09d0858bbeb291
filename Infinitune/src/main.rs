use itnconfig::get_config;
use itnpipeline::{GenerationExt, GenerationSettings, Pipeline};
use itnproviders::ProviderRegistry;
use itnroom::{RoomManager, RoomTuning, RoomsExt};
use itnserver::{ConfigExt, LoggingOptions, init_server};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ========== PHASE 1 : Infrastructure HTTP ==========

    let server = init_server();
    server
        .write()
        .await
        .init_logging(LoggingOptions::default())
        .await;

    server
        .write()
        .await
        .add_route("/info", || async {
            serde_json::json!({"name": "infinitune", "version": env!("CARGO_PKG_VERSION")})
        })
        .await;

    info!("📡 Initializing configuration API...");
    server
        .write()
        .await
        .init_config_api()
        .await
        .expect("Failed to initialize configuration API");

    // ========== PHASE 2 : Pipeline de génération ==========

    info!("🗄️  Opening generation store...");
    let store = itnstore::init_store_from_config().expect("Failed to open generation store");

    info!("🎛️  Registering inference providers...");
    let registry =
        Arc::new(ProviderRegistry::from_config().expect("Failed to build provider registry"));

    info!("🎵 Starting generation pipeline...");
    let pipeline = Pipeline::init(
        store.clone(),
        registry,
        GenerationSettings::from_config(),
    )
    .await;

    // Les changements de configuration réappliquent les limites de
    // concurrence en ligne.
    {
        let mut changes = itnconfig::api::subscribe_changes();
        let store = store.clone();
        tokio::spawn(async move {
            while let Ok(path) = changes.recv().await {
                if path.starts_with("providers.") || path.starts_with("generation.") {
                    store.emit_settings_changed();
                }
            }
        });
    }

    server
        .write()
        .await
        .init_generation_api()
        .await
        .expect("Failed to initialize generation API");

    // ========== PHASE 3 : Rooms ==========

    info!("📻 Starting room runtime...");
    let config = get_config();
    RoomManager::init(
        store.clone(),
        RoomTuning {
            start_lead_ms: config.get_u64_or(&["room", "start_lead_ms"], 300) as i64,
            drift_threshold_ms: config.get_u64_or(&["room", "drift_threshold_ms"], 500) as i64,
        },
    );
    server
        .write()
        .await
        .init_rooms()
        .await
        .expect("Failed to initialize room runtime");

    // ========== PHASE 4 : Démarrage ==========

    info!("🌐 Starting HTTP server...");
    server.write().await.start().await;

    info!("✅ Infinitune server is ready!");
    info!("Press Ctrl+C to stop...");

    server.write().await.wait().await;

    info!("Shutting down generation pipeline...");
    pipeline.shutdown();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    info!("✅ Infinitune server stopped");
    Ok(())
}
