// src/main.rs - croma-host entry point
use clap::Parser;
use croma_rs::communication::{LinuxSerial, SerialTransport};
use croma_rs::config::{Args, Config};
use croma_rs::file_manager::FileManager;
use croma_rs::hardware::filament::spawn_sensor_poller;
use croma_rs::hardware::{FilamentHandle, FilamentMonitor, FilamentSensor, GpioValueSensor};
use croma_rs::store::{JobStore, RecordStore};
use croma_rs::{web, PrinterController};
use croma_shared::serial_interface::SerialInterface;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting croma-host");
    let config = args.resolve().inspect_err(|e| {
        tracing::error!(path = %args.config.display(), error = %e, "Invalid configuration");
    })?;
    tracing::info!(port = %config.serial.port, baud = config.serial.baud, "Serial settings");

    let transport = Arc::new(SerialTransport::new(serial_driver(&args), config.serial.clone()));
    let store = open_store(&config)?;
    FileManager::new(&config.storage.gcode_dir).scan(store.as_ref()).await?;
    let filament = start_filament_monitor(&config, Arc::clone(&transport)).await;

    let controller = Arc::new(PrinterController::new(config.clone(), transport, store, filament));
    if let Err(e) = controller.connect().await {
        tracing::warn!(error = %e, "Printer not connected at start-up, will retry on first use");
    }

    let app = web::create_router(Arc::clone(&controller));
    let listener = tokio::net::TcpListener::bind(&config.web.bind).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    controller.shutdown().await;
    tracing::info!("croma-host stopped");
    Ok(())
}

#[allow(unused_variables)]
fn serial_driver(args: &Args) -> Arc<dyn SerialInterface> {
    #[cfg(feature = "sim-in-host")]
    if args.simulate {
        tracing::info!("Using the virtual printer");
        return Arc::new(croma_simulator::VirtualPrinter::new());
    }
    Arc::new(LinuxSerial)
}

fn open_store(config: &Config) -> Result<Arc<dyn JobStore>, BoxError> {
    Ok(match &config.storage.state_file {
        Some(path) => Arc::new(RecordStore::open(path)?),
        None => Arc::new(RecordStore::in_memory()),
    })
}

async fn start_filament_monitor(config: &Config, transport: Arc<SerialTransport>) -> FilamentHandle {
    let settings = &config.filament;
    let Some(path) = settings.sensor_path.as_ref().filter(|_| settings.enabled) else {
        tracing::info!("No filament sensor configured");
        return FilamentHandle::disabled();
    };
    let sensor: Arc<dyn FilamentSensor> = Arc::new(GpioValueSensor::new(path));
    let (handle, _monitor) = FilamentMonitor::spawn(transport, settings, Some(Arc::clone(&sensor))).await;
    if let (Some(interval), Some(events)) = (settings.poll_interval_ms, handle.events()) {
        spawn_sensor_poller(sensor, events, Duration::from_millis(interval));
    }
    handle
}
