pub mod diagnostics;
pub mod metrics;
pub mod models;
pub mod publish;
pub mod scheduler;
pub mod sensors;
pub mod settings;
mod utils;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use publish::MqttPublisher;
use scheduler::{Scheduler, SchedulerConfig, SchedulerController, SensorSet, SensorSlot};
use sensors::{
    hal::{I2cRegisterBus, SerialByteSource},
    FrameDecoder, RegisterBus, RegisterTempReader, WindowedByteSampler,
};
use settings::{I2cSettings, Settings, CONFIG_ENV};

/// Settings file path: first CLI argument, else `EDGESENSE_CONFIG`.
fn settings_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from)
}

/// Opens every configured device. The range finder and thermometer must be
/// present at startup; the radar is optional.
fn open_sensors(settings: &Settings) -> Result<SensorSet> {
    let tf_luna = &settings.tf_luna;
    let source = SerialByteSource::open(&tf_luna.path, tf_luna.baud_rate, tf_luna.read_timeout())
        .context("TF-Luna range finder is required")?;
    let distance = FrameDecoder::new(source)
        .timeout(settings.frame_timeout())
        .verify_checksum(settings.verify_distance_checksum);
    info!("TF-Luna attached on {} @ {} baud", tf_luna.path, tf_luna.baud_rate);

    let bus = open_register_bus(&settings.mlx90614).context("MLX90614 thermometer is required")?;
    let temperature = RegisterTempReader::with_address(bus, settings.mlx90614.address);
    info!(
        "MLX90614 attached on {} at {:#04x}",
        settings.mlx90614.bus, settings.mlx90614.address
    );

    let radar = match &settings.ld6002 {
        None => {
            info!("LD6002 radar disabled");
            SensorSlot::Missing
        }
        Some(serial) => {
            match SerialByteSource::open(&serial.path, serial.baud_rate, serial.read_timeout()) {
                Ok(source) => {
                    info!("LD6002 attached on {} @ {} baud", serial.path, serial.baud_rate);
                    SensorSlot::Attached(Box::new(WindowedByteSampler::new(
                        source,
                        settings.window(),
                    )) as scheduler::loop_worker::RadarSensor)
                }
                Err(err) => {
                    warn!("LD6002 radar unavailable, continuing without it: {err:#}");
                    SensorSlot::Missing
                }
            }
        }
    };

    Ok(SensorSet {
        distance: SensorSlot::Attached(Box::new(distance)),
        temperature: SensorSlot::Attached(Box::new(temperature)),
        radar,
    })
}

#[cfg(target_os = "linux")]
fn open_register_bus(i2c: &I2cSettings) -> Result<Box<dyn RegisterBus>> {
    let dev = linux_embedded_hal::I2cdev::new(&i2c.bus)
        .with_context(|| format!("failed to open I2C bus {}", i2c.bus))?;
    Ok(Box::new(I2cRegisterBus::new(dev)))
}

#[cfg(not(target_os = "linux"))]
fn open_register_bus(i2c: &I2cSettings) -> Result<Box<dyn RegisterBus>> {
    anyhow::bail!("I2C bus {} is only supported on Linux", i2c.bus)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn run() -> Result<()> {
    // RUST_LOG wins; otherwise info and above.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("edgesense starting up...");

    let settings = Settings::load(settings_path().as_deref())?;
    info!(
        "device={} topic={} interval={}s window={}s broker={}:{}",
        settings.device_id,
        settings.topic,
        settings.interval_sec,
        settings.window_sec,
        settings.mqtt.host,
        settings.mqtt.port
    );

    let sensors = open_sensors(&settings)?;

    let shutdown = CancellationToken::new();
    let publisher = Arc::new(MqttPublisher::connect(
        &settings.mqtt,
        &settings.device_id,
        &shutdown,
    ));

    let scheduler = Scheduler::new(SchedulerConfig::from(&settings), sensors, publisher.clone())?;
    let mut controller = SchedulerController::new();
    controller.start(scheduler, &shutdown)?;

    shutdown_signal().await;
    info!("Shutdown requested");

    controller.stop().await?;

    match Arc::try_unwrap(publisher) {
        Ok(publisher) => publisher.disconnect().await,
        Err(_) => warn!("publisher still shared at shutdown; skipping DISCONNECT"),
    }
    shutdown.cancel();

    if let Some(metrics) = controller.metrics() {
        let snapshot = metrics.get_snapshot().await;
        info!(
            "ran {} cycles ({} publish failures, {} sensor absences)",
            snapshot.cycle_count, snapshot.publish_failures, snapshot.sensor_absences
        );
    }

    Ok(())
}
