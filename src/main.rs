use push_deploy::runner::ProcessRunner;
use push_deploy::{AppState, api, load_config, logging};
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "push_deploy.toml";

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config_path =
        std::env::var("PUSH_DEPLOY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Keep the guard alive so file logs are flushed on exit
    let _log_guard = match logging::setup_logging(config.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging setup failed: {}", e);
            std::process::exit(1);
        }
    };

    let bind_address = config.bind_address();
    info!("Using config at {:?}", config_path);
    info!("App directory: {}", config.app_dir.display());
    info!("Test directory: {}", config.test_dir().display());
    info!("Deploy script: {}", config.deploy_script.display());

    let state = Arc::new(AppState::new(config, Arc::new(ProcessRunner)));
    let app = api::router(state);

    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", bind_address, e);
            std::process::exit(1);
        }
    };
    info!("Listening on {}, waiting for webhook deliveries", bind_address);

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
