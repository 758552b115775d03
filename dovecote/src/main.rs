use std::fs;
use std::process;

use tokio::net::TcpListener;
use tracing::info;

use dovecote::{Hub, ServerOptions};

// Flag and config-file handling belong to the embedding harness; the
// standalone binary serves the built-in defaults.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = ServerOptions::default();
    if let Some(pid_file) = &opts.pid_file {
        fs::write(pid_file, process::id().to_string())?;
    }

    let hub = Hub::new(opts);
    let addr = (hub.options().host.clone(), hub.options().port);
    let listener = TcpListener::bind(addr).await?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting dovecote");
    hub.serve(listener).await?;
    Ok(())
}
