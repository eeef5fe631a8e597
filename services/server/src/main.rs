// ut-server: standalone server binary.
//
// Loads TOML config from the first argument (default
// /etc/utran/server.toml, falling back to built-in defaults when the file
// does not exist) and serves an empty registry; embedders register methods
// through the library API.

use tracing::info;
use ut_server::UtServer;
use ut_server::config::{self, ServerConfig};
use ut_server::registry::MethodRegistry;

const DEFAULT_CONFIG_PATH: &str = "/etc/utran/server.toml";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "ut-server starting");

    let cfg = match std::env::args().nth(1) {
        Some(path) => match config::load_config_from_path(std::path::Path::new(&path)) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("FATAL: failed to load config: {err}");
                std::process::exit(1);
            }
        },
        None => {
            let default_path = std::path::Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                match config::load_config_from_path(default_path) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        eprintln!("FATAL: failed to load config: {err}");
                        std::process::exit(1);
                    }
                }
            } else {
                ServerConfig::default()
            }
        }
    };

    let server = match UtServer::start(cfg, MethodRegistry::builder().build()).await {
        Ok(server) => server,
        Err(err) => {
            eprintln!("FATAL: failed to start server: {err}");
            std::process::exit(1);
        }
    };

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
    server.exit();
}
