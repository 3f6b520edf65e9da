//! Apppool server — process pool core with a minimal control surface.

use apppool_core::control::ControlServer;
use apppool_core::types::Config;

fn load_config() -> Config {
    match std::env::var("APPPOOL_CONFIG_FILE") {
        Ok(path) => match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("failed to parse {path}: {e}, falling back to defaults");
                    Config::default()
                }
            },
            Err(e) => {
                eprintln!("failed to read {path}: {e}, falling back to defaults");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = load_config();
    apppool_core::observability::init_tracing(&config.observability);

    let pool = apppool_core::pool::spawn(config.clone());
    let control = ControlServer::new(pool.clone(), &config.control)?;
    let control_cancel = control.cancellation_token();

    tracing::info!("apppool server starting");

    tokio::select! {
        result = control.serve() => {
            if let Err(e) = result {
                tracing::error!("control surface exited with error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    control_cancel.cancel();
    pool.shutdown();
    Ok(())
}
