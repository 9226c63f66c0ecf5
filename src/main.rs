mod api;
mod app;
mod buffer;
mod config;
mod constants;
mod error;
mod metrics;
mod persistence;
mod registry;
mod session;
mod shutdown;
mod topics;
mod utils;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    app::BrokerApp::run().await
}
