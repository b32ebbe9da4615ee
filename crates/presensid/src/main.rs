use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use zbus::connection;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presensid starting");

    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        bus = ?config.bus,
        "configuration loaded"
    );

    let engine = engine::spawn_engine(&config).context("starting engine")?;
    let service = AttendanceService::new(engine, config.site, config.radius_m);

    let builder = match config.bus {
        BusKind::Session => connection::Builder::session()?,
        BusKind::System => connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the message bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "presensid ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("presensid shutting down");

    Ok(())
}
