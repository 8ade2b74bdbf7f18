//! Service Lifecycle (C7).
//!
//! Wires C1 (sensor bindings) through C5 (the interleave coordinator)
//! into C2 (the engine facade), starts the C3/C4 producer threads, and
//! exposes the host-facing query surface. One `Service` per running
//! map session; `stop` is idempotent and safe to call from `Drop`.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Coordinator;
use crate::config::{Defaults, OperatingMode, RawSettings, ResolvedConfig};
#[cfg(feature = "native-engine")]
use crate::engine::NativeCartoFacade;
use crate::engine::{CartoFacade, PositionResponse};
use crate::error::CoreError;
use crate::ingestion::{run_imu_loop, run_lidar_loop};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::sensor::{ImuBinding, LidarBinding, SensorContext};
use crate::storage;

/// The resolved sensor bindings a caller must hand the service at
/// construction time; names must match the dependency list returned
/// by [`crate::config::RawSettings::dependencies`].
pub struct SensorBindings {
    pub lidar: LidarBinding,
    pub imu: Option<ImuBinding>,
}

/// How often the map-writer thread snapshots `internal_state` to
/// disk, driven by `map_rate_sec` (spec.md §4.7). A `map_rate_sec` of
/// zero means `Localizing` mode, which never snapshots.
fn map_writer_interval(cfg: &ResolvedConfig) -> Option<Duration> {
    match cfg.mode {
        OperatingMode::Localizing => None,
        OperatingMode::Mapping | OperatingMode::Updating => {
            Some(Duration::from_secs(cfg.map_rate_sec.max(1) as u64))
        }
    }
}

struct Producers {
    ctx: SensorContext,
    handles: Vec<JoinHandle<()>>,
}

/// A running SLAM ingestion session: owns the producer threads, the
/// optional map-writer thread, and the engine facade they feed.
pub struct Service {
    config: ResolvedConfig,
    lidar_binding: LidarBinding,
    imu_binding: Option<ImuBinding>,
    facade: Arc<dyn CartoFacade>,
    coordinator: Arc<Coordinator>,
    metrics: Arc<Metrics>,
    producers: Option<Producers>,
    map_writer: Option<JoinHandle<()>>,
    stopped: bool,
}

impl Service {
    /// Resolves `raw` against `defaults`, scans `data_dir` for prior
    /// internal state, starts the native engine, and starts ingestion.
    /// `bindings` must already satisfy the dependency list produced by
    /// configuration validation.
    ///
    /// Only available with the `native-engine` feature, since it
    /// starts [`NativeCartoFacade`](crate::engine::NativeCartoFacade).
    /// Tests and the replay CLI use [`Service::with_facade`] instead.
    #[cfg(feature = "native-engine")]
    pub fn start(
        raw: &RawSettings,
        defaults: &Defaults,
        bindings: SensorBindings,
    ) -> Result<Self, CoreError> {
        let data_dir_probe = raw
            .data_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_default();
        let prior_state = storage::newest_internal_state(&data_dir_probe)?;
        let (config, _deps) = ResolvedConfig::resolve(raw, defaults, prior_state.is_some())?;

        if bindings.lidar.name != config.lidar_name {
            return Err(CoreError::SensorValidation(format!(
                "lidar binding {:?} does not match configured lidar {:?}",
                bindings.lidar.name, config.lidar_name
            )));
        }
        match (&bindings.imu, &config.imu_name) {
            (Some(imu), Some(expected)) if &imu.name != expected => {
                return Err(CoreError::SensorValidation(format!(
                    "imu binding {:?} does not match configured movement sensor {:?}",
                    imu.name, expected
                )));
            }
            (None, Some(expected)) => {
                return Err(CoreError::SensorValidation(format!(
                    "movement sensor {expected:?} is configured but no imu binding was provided"
                )));
            }
            _ => {}
        }

        tracing::info!(
            mode = ?config.mode,
            lidar = %config.lidar_name,
            imu = ?config.imu_name,
            "starting slam ingestion service"
        );

        let facade: Arc<dyn CartoFacade> = Arc::new(NativeCartoFacade::start(
            &config,
            config.mode,
            prior_state.as_deref(),
        )?);

        Self::with_facade(config, bindings, facade)
    }

    /// Construction path used by tests and the replay CLI: takes an
    /// already-built facade (the native one, or
    /// [`crate::testutil::MockCartoFacade`]) instead of starting the
    /// native engine itself, then starts ingestion exactly as
    /// [`Service::start`] does.
    pub fn with_facade(
        config: ResolvedConfig,
        bindings: SensorBindings,
        facade: Arc<dyn CartoFacade>,
    ) -> Result<Self, CoreError> {
        let coordinator = Arc::new(Coordinator::new(
            bindings.imu.is_some(),
            config.lidar_data_interval,
            config.imu_data_interval,
        ));
        let mut service = Self {
            config,
            lidar_binding: bindings.lidar,
            imu_binding: bindings.imu,
            facade,
            coordinator,
            metrics: Arc::new(Metrics::default()),
            producers: None,
            map_writer: None,
            stopped: false,
        };
        service.spawn_producers();
        service.spawn_map_writer();
        Ok(service)
    }

    fn spawn_producers(&mut self) {
        let ctx = SensorContext::new();
        let mut handles = Vec::with_capacity(2);

        let lidar = self.lidar_binding.clone();
        let facade = self.facade.clone();
        let coordinator = self.coordinator.clone();
        let metrics = self.metrics.clone();
        let use_live_data = self.config.use_live_data;
        let lidar_interval = self.config.lidar_data_interval;
        let deadline = self.config.deadline;
        let lidar_ctx = ctx.clone();
        handles.push(std::thread::spawn(move || {
            run_lidar_loop(
                &lidar,
                facade.as_ref(),
                coordinator.as_ref(),
                metrics.as_ref(),
                use_live_data,
                lidar_interval,
                deadline,
                &lidar_ctx,
            );
        }));

        if let Some(imu) = self.imu_binding.clone() {
            let facade = self.facade.clone();
            let coordinator = self.coordinator.clone();
            let metrics = self.metrics.clone();
            let imu_interval = self.config.imu_data_interval;
            let imu_ctx = ctx.clone();
            handles.push(std::thread::spawn(move || {
                run_imu_loop(
                    &imu,
                    facade.as_ref(),
                    coordinator.as_ref(),
                    metrics.as_ref(),
                    use_live_data,
                    imu_interval,
                    deadline,
                    &imu_ctx,
                );
            }));
        }

        self.producers = Some(Producers { ctx, handles });
    }

    fn spawn_map_writer(&mut self) {
        let Some(interval) = map_writer_interval(&self.config) else {
            return;
        };
        let Some(producers) = &self.producers else {
            return;
        };
        let ctx = producers.ctx.clone();
        let facade = self.facade.clone();
        let data_dir = self.config.data_dir.clone();
        let prefix = self.config.lidar_name.clone();
        self.map_writer = Some(std::thread::spawn(move || loop {
            if ctx.is_cancelled() {
                return;
            }
            std::thread::sleep(interval);
            if ctx.is_cancelled() {
                return;
            }
            match facade.internal_state() {
                Ok(bytes) => {
                    match storage::write_internal_state_snapshot(
                        &data_dir,
                        &prefix,
                        Utc::now(),
                        &bytes,
                    ) {
                        Ok(path) => {
                            tracing::info!(path = %path.display(), "wrote internal state snapshot")
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to write internal state snapshot")
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read internal state for snapshot")
                }
            }
        }));
    }

    pub fn mode(&self) -> OperatingMode {
        self.config.mode
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn get_position(&self) -> Result<PositionResponse, CoreError> {
        self.facade.position()
    }

    pub fn get_point_cloud_map(&self) -> Result<Vec<u8>, CoreError> {
        self.facade.point_cloud_map()
    }

    pub fn get_internal_state(&self) -> Result<Vec<u8>, CoreError> {
        self.facade.internal_state()
    }

    pub fn get_latest_map_info(&self) -> Result<DateTime<Utc>, CoreError> {
        self.facade.latest_map_info()
    }

    /// Cancels producers and the map writer, joins them, and stops the
    /// engine. Safe to call more than once.
    pub fn stop(&mut self) -> Result<(), CoreError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        if let Some(producers) = self.producers.take() {
            producers.ctx.cancel();
            for handle in producers.handles {
                let _ = handle.join();
            }
        }
        if let Some(writer) = self.map_writer.take() {
            let _ = writer.join();
        }
        self.facade.run_optimization().ok();
        self.facade.stop()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if !self.stopped {
            if let Err(err) = self.stop() {
                tracing::warn!(error = %err, "error stopping service during drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{AngularVelocityUnit, ImuCapabilities, LidarCapabilities};
    use crate::testutil::{ContentionPolicy, MockCartoFacade, MockImuSensor, MockLidarSensor};

    fn bindings(lidar_count: usize, imu_count: usize, with_imu: bool) -> SensorBindings {
        let start = Utc::now();
        let lidar = LidarBinding::new(
            "lidar0",
            MockLidarSensor::new(
                lidar_count,
                start,
                Duration::from_millis(100),
                10,
                true,
            ),
            LidarCapabilities { supports_pcd: true },
        )
        .unwrap();
        let imu = if with_imu {
            Some(
                ImuBinding::new(
                    "imu0",
                    MockImuSensor::new(imu_count, start, Duration::from_millis(25), true),
                    ImuCapabilities {
                        supports_linear_acceleration: true,
                        supports_angular_velocity: true,
                    },
                    AngularVelocityUnit::RadiansPerSecond,
                )
                .unwrap(),
            )
        } else {
            None
        };
        SensorBindings { lidar, imu }
    }

    fn mapping_config(use_live_data: bool) -> ResolvedConfig {
        ResolvedConfig {
            lidar_name: "lidar0".into(),
            imu_name: Some("imu0".into()),
            data_dir: PathBuf::from(std::env::temp_dir()),
            mode_param: "2d".into(),
            lidar_data_interval: Duration::from_millis(10),
            imu_data_interval: Duration::from_millis(5),
            map_rate_sec: 1,
            deadline: Duration::from_secs(1),
            use_live_data,
            delete_processed_data: false,
            mode: OperatingMode::Mapping,
        }
    }

    #[test]
    fn replay_mapping_ingests_all_readings_then_drains() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mapping_config(false);
        config.data_dir = dir.path().to_path_buf();

        let mock: Arc<MockCartoFacade> = Arc::new(MockCartoFacade::new(ContentionPolicy::default()));
        let facade: Arc<dyn CartoFacade> = mock.clone();

        let mut service = Service::with_facade(config, bindings(20, 80, true), facade).unwrap();
        std::thread::sleep(Duration::from_millis(500));
        service.stop().unwrap();

        assert_eq!(mock.lidar_submissions().len(), 20);
        assert_eq!(mock.total_points(), 20 * 10);
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mapping_config(false);
        config.data_dir = dir.path().to_path_buf();
        let facade: Arc<dyn CartoFacade> = Arc::new(MockCartoFacade::new(ContentionPolicy::default()));
        let mut service = Service::with_facade(config, bindings(2, 4, true), facade).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        service.stop().unwrap();
        service.stop().unwrap();
    }

    #[test]
    fn localizing_mode_never_spawns_map_writer() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mapping_config(false);
        config.data_dir = dir.path().to_path_buf();
        config.mode = OperatingMode::Localizing;
        let facade: Arc<dyn CartoFacade> = Arc::new(MockCartoFacade::new(ContentionPolicy::default()));
        let mut service = Service::with_facade(config, bindings(1, 1, true), facade).unwrap();
        assert!(service.map_writer.is_none());
        service.stop().unwrap();
    }
}
