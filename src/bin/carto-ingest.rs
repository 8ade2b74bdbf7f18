use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use carto_ingest::config::{Defaults, RawSettings};
use carto_ingest::replay::{ReplayImuSensor, ReplayLidarSensor};
use carto_ingest::sensor::{AngularVelocityUnit, ImuCapabilities, LidarCapabilities};
use carto_ingest::{setup_tracing, ImuBinding, LidarBinding, SensorBindings, Service};

/// Stand-alone runner wiring a configuration file and a pair of
/// replay directories into the ingestion and scheduling core. Not
/// part of the core itself; a convenience entry point for manual
/// runs and integration exercises against recorded data.
#[derive(Parser, Debug)]
#[command()]
struct Args {
    /// Path to the JSON configuration file (either accepted shape).
    #[clap(long)]
    config: PathBuf,

    /// Directory containing the lidar replay manifest.
    #[clap(long)]
    lidar_replay_dir: PathBuf,

    /// Directory containing the IMU replay manifest, if the
    /// configuration names a movement sensor.
    #[clap(long)]
    imu_replay_dir: Option<PathBuf>,

    /// Overrides the resolved host port.
    #[clap(long)]
    port: Option<u16>,

    /// Overrides the resolved lidar submission interval in milliseconds.
    #[clap(long)]
    data_rate_msec: Option<u64>,

    /// Overrides the resolved map snapshot interval in seconds.
    #[clap(long)]
    map_rate_sec: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_tracing()?;

    let raw = RawSettings::from_path(&args.config)?;

    let defaults = Defaults {
        port: args.port.unwrap_or(Defaults::default().port),
        data_rate_msec: args
            .data_rate_msec
            .unwrap_or(Defaults::default().data_rate_msec),
        map_rate_sec: args
            .map_rate_sec
            .unwrap_or(Defaults::default().map_rate_sec),
        ..Defaults::default()
    };

    let lidar_sensor = ReplayLidarSensor::open(&args.lidar_replay_dir)?;
    let lidar = LidarBinding::new(
        lidar_name(&raw)?,
        lidar_sensor,
        LidarCapabilities { supports_pcd: true },
    )?;

    let imu = match (&args.imu_replay_dir, &raw.movement_sensor) {
        (Some(dir), Some(sensor_ref)) => {
            let imu_sensor = ReplayImuSensor::open(dir)?;
            Some(ImuBinding::new(
                sensor_ref.name.clone(),
                imu_sensor,
                ImuCapabilities {
                    supports_linear_acceleration: true,
                    supports_angular_velocity: true,
                },
                AngularVelocityUnit::RadiansPerSecond,
            )?)
        }
        _ => None,
    };

    let mut service = Service::start(&raw, &defaults, SensorBindings { lidar, imu })?;
    info!(mode = ?service.mode(), "service started, waiting for ctrl-c");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    service.stop()?;
    Ok(())
}

fn lidar_name(raw: &RawSettings) -> anyhow::Result<String> {
    if let Some(camera) = &raw.camera {
        return Ok(camera.name.clone());
    }
    match &raw.sensors {
        Some(sensors) if sensors.len() == 1 => Ok(sensors[0].clone()),
        _ => anyhow::bail!("configuration must name exactly one lidar"),
    }
}
