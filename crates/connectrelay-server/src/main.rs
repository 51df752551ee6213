//! ConnectRelay — local relay between the LinkedIn extension, the web app and the CRM API.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use connectrelay_browser::RelaySettings;
use connectrelay_core::RelayConfig;
use connectrelay_server::{build_router, AppState};
use connectrelay_store::{SharedStore, SqliteStore};

fn resolve_data_dir() -> PathBuf {
    std::env::var("CONNECTRELAY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--help" | "-h" | "help" => {
                println!("ConnectRelay — extension message relay and CRM forwarder");
                println!();
                println!("Usage: connectrelay [command]");
                println!();
                println!("Commands:");
                println!("  (none)    Start the server");
                println!("  help      Show this help message");
                println!();
                println!("Environment:");
                println!("  CONNECTRELAY_DATA_DIR   Data directory (default: data)");
                println!("  CONNECTRELAY_HOST       Bind address (default: 127.0.0.1)");
                println!("  PORT                    HTTP port (default: 3011)");
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'connectrelay help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    let data_dir = resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let config = RelayConfig::from_env(&data_dir)?;

    let settings_file = &config.data_paths.settings_file;
    let settings = RelaySettings::load(settings_file);
    if !settings_file.exists() {
        settings
            .save()
            .map_err(|e| anyhow::anyhow!("Failed to write default settings: {}", e))?;
        info!("Wrote default settings to {}", settings_file.display());
    }

    let store = SqliteStore::open(&config.data_paths.store)
        .map_err(|e| anyhow::anyhow!("Failed to open store: {}", e))?;
    info!("Store: {}", store.db_path().display());
    let store: SharedStore = Arc::new(store);

    let addr = config.bind_addr();
    let state = Arc::new(
        AppState::new(config, settings, store)
            .map_err(|e| anyhow::anyhow!("Failed to build relay: {}", e))?,
    );

    state
        .relay
        .on_installed()
        .await
        .map_err(|e| anyhow::anyhow!("Startup hook failed: {}", e))?;

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("ConnectRelay listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
