//! MLX90614 bench tool.
//!
//! ```text
//! mlx90614_longrun [--check] [--bus /dev/i2c-1] [--address 0x5a] [--warmup SECS]
//! ```
//!
//! Without `--check` it warms up for a minute and then logs a paired reading
//! every second until Ctrl+C. `--check` takes ten readings and stops at the
//! first bus error.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use tokio_util::sync::CancellationToken;

use edgesense_lib::{
    diagnostics::{BenchConfig, Mlx90614Bench, StopReason},
    sensors::{mlx90614::DEFAULT_ADDRESS, RegisterBus, RegisterTempReader},
};

struct Args {
    check: bool,
    bus: String,
    address: u8,
    warmup: Option<Duration>,
}

fn parse_address(value: &str) -> Result<u8> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.with_context(|| format!("invalid I2C address {value:?}"))
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args {
        check: false,
        bus: "/dev/i2c-1".into(),
        address: DEFAULT_ADDRESS,
        warmup: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--check" => parsed.check = true,
            "--bus" => parsed.bus = args.next().context("--bus needs a device path")?,
            "--address" => {
                parsed.address = parse_address(&args.next().context("--address needs a value")?)?
            }
            "--warmup" => {
                let secs: u64 = args
                    .next()
                    .context("--warmup needs seconds")?
                    .parse()
                    .context("--warmup must be whole seconds")?;
                parsed.warmup = Some(Duration::from_secs(secs));
            }
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(parsed)
}

#[cfg(target_os = "linux")]
fn open_bus(path: &str) -> Result<Box<dyn RegisterBus>> {
    let dev = linux_embedded_hal::I2cdev::new(path)
        .with_context(|| format!("failed to open I2C bus {path}"))?;
    Ok(Box::new(edgesense_lib::sensors::hal::I2cRegisterBus::new(dev)))
}

#[cfg(not(target_os = "linux"))]
fn open_bus(path: &str) -> Result<Box<dyn RegisterBus>> {
    bail!("I2C bus {path} is only supported on Linux")
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args(std::env::args().skip(1))?;
    let mut config = if args.check {
        BenchConfig::check()
    } else {
        BenchConfig::longrun()
    };
    if let Some(warmup) = args.warmup {
        config.warmup = warmup;
    }

    let bus = open_bus(&args.bus)?;
    let reader = RegisterTempReader::with_address(bus, args.address);
    info!(
        "MLX90614 on {} at {:#04x}: warm-up {}s, then {}",
        args.bus,
        args.address,
        config.warmup.as_secs(),
        match config.max_readings {
            Some(n) => format!("{n} readings"),
            None => "readings until Ctrl+C".to_string(),
        }
    );

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Stopped by user");
            }
            cancel.cancel();
        })
    };

    let bench_cancel = cancel.clone();
    let summary = tokio::task::spawn_blocking(move || {
        let mut bench = Mlx90614Bench::new(reader, config);
        bench.run(&bench_cancel, |sample| info!("{sample}"))
    })
    .await
    .context("bench thread panicked")?;
    ctrl_c.abort();

    info!(
        "{} readings, {} failed (warm-up: {} reads, {} failed)",
        summary.samples, summary.failures, summary.warmup_reads, summary.warmup_failures
    );
    if summary.stopped_by == StopReason::ReadFailed {
        bail!("MLX90614 read failed");
    }
    Ok(())
}
