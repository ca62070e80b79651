//! counterd server binary.
//!
//! Configuration comes from `COUNTER_*` environment variables (see
//! [`counterd::config`]); log filtering from `RUST_LOG`.
//!
//! ```bash
//! RUST_LOG=info COUNTER_STORE_PATH=/data/counter.db cargo run --release --bin counterd
//! ```
//!
//! Several processes may share one `COUNTER_STORE_PATH`; each serves its own
//! port.

use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use counterd::server::{self, AppState};
use counterd::Config;

#[tokio::main]
async fn main() -> ExitCode {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "counterd failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> counterd::Result<()> {
    let config = Config::from_env()?;

    info!(store = %config.store_path.display(), "Initializing state...");
    let state = AppState::open(&config).await?;

    let address = format!("0.0.0.0:{}", config.port);
    info!("Binding to {address}");
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| counterd::Error::Config(format!("cannot bind {address}: {e}")))?;

    let served = server::serve(listener, state.clone(), server::shutdown_signal()).await;

    info!("Server shutting down...");
    state.shutdown().await;
    served
}
