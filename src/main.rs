//! This file defines the cubeops binary entry point.

use cubeops::app;
use cubeops::cli;
use cubeops::metrics;
use cubeops::server;
use cubeops::tracing;

/// Application entry point
#[tokio::main]
async fn main() {
    let args = cli::parse();
    tracing::init_tracing();
    metrics::register_metrics();
    let service = app::service(&args).await;
    server::serve(&args, service).await;
}
