mod app;
mod config;
mod mail;
mod util;

use std::env;
use std::path::Path;
use tokio::runtime::Builder;
use tracing::error;

fn main() {
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .json()
        .init();

    let config_path = env::var("COMCORE_CONFIG").unwrap_or_else(|_| "comcore.toml".to_string());
    let config = config::load_configuration(Path::new(&config_path)).expect("configuration");

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    if let Err(err) = runtime.block_on(app::run(config)) {
        error!(error = %err, "server terminated");
        std::process::exit(1);
    }
}
