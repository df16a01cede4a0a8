mod app;
mod catalog;
mod config;
mod dedup;
mod domain;
mod github;
mod pull_requests;
mod state;
mod storage;

use app::{APP_NAME, DashboardApp};
use config::AppConfig;
use eframe::NativeOptions;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> eframe::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env();
    let options = NativeOptions::default();
    eframe::run_native(
        APP_NAME,
        options,
        Box::new(move |cc| Ok(Box::new(DashboardApp::new(cc, &config)?))),
    )
}
