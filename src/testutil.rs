//! Deterministic test fixtures: mock sensors and a mock engine
//! facade. Mirrors the original implementation's
//! `IntegrationTimedLidarSensor` / `IntegrationTimedIMUSensor` /
//! stub-dependency mocks, but generates its readings in memory and
//! takes its reading count/interval as parameters rather than
//! pointing at a hard-coded developer mock-data path (spec §9 Open
//! Questions).
#![doc(hidden)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::engine::{CartoFacade, Pose, PositionResponse};
use crate::error::CoreError;
use crate::sensor::{SensorContext, TimedImuSensor, TimedLidarSensor, TimedLidarReading, TimedImuReading, Vector3};

/// Builds a minimal binary-PCD-shaped payload with `num_points`
/// points, good enough for tests that only care about point counts
/// round-tripping through the mock facade.
pub fn make_pcd(num_points: usize) -> Vec<u8> {
    let header = format!(
        "# .PCD v0.7 - Point Cloud Data file format\n\
         VERSION 0.7\n\
         FIELDS x y z\n\
         SIZE 4 4 4\n\
         TYPE F F F\n\
         COUNT 1 1 1\n\
         WIDTH {num_points}\n\
         HEIGHT 1\n\
         VIEWPOINT 0 0 0 1 0 0 0\n\
         POINTS {num_points}\n\
         DATA binary\n"
    );
    let mut bytes = header.into_bytes();
    for i in 0..num_points {
        let v = i as f32;
        bytes.extend_from_slice(&v.to_le_bytes());
        bytes.extend_from_slice(&v.to_le_bytes());
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Parses the `POINTS <n>` header line written by [`make_pcd`].
fn pcd_point_count(pcd: &[u8]) -> usize {
    let text = String::from_utf8_lossy(pcd);
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("POINTS ") {
            if let Ok(n) = rest.trim().parse() {
                return n;
            }
        }
    }
    0
}

/// A scripted, deterministic lidar source. Produces `count` readings
/// spaced `interval` apart starting at `start`, then reports
/// `EndOfStream` forever after.
pub struct MockLidarSensor {
    readings: Mutex<VecDeque<TimedLidarReading>>,
}

impl MockLidarSensor {
    pub fn new(
        count: usize,
        start: DateTime<Utc>,
        interval: Duration,
        points_per_reading: usize,
        replay: bool,
    ) -> Self {
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
        let mut readings = VecDeque::with_capacity(count);
        let mut time = start;
        for _ in 0..count {
            readings.push_back(TimedLidarReading {
                pcd: make_pcd(points_per_reading),
                time,
                replay,
            });
            time += interval;
        }
        Self {
            readings: Mutex::new(readings),
        }
    }
}

impl TimedLidarSensor for MockLidarSensor {
    fn next_reading(&self, _ctx: &SensorContext) -> Result<TimedLidarReading, CoreError> {
        match self.readings.lock().unwrap().pop_front() {
            Some(reading) => Ok(reading),
            None => Err(CoreError::EndOfStream),
        }
    }
}

/// A scripted, deterministic IMU source.
pub struct MockImuSensor {
    readings: Mutex<VecDeque<TimedImuReading>>,
}

impl MockImuSensor {
    pub fn new(count: usize, start: DateTime<Utc>, interval: Duration, replay: bool) -> Self {
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
        let mut readings = VecDeque::with_capacity(count);
        let mut time = start;
        for i in 0..count {
            readings.push_back(TimedImuReading {
                linear_acceleration: Vector3::new(0.0, 0.0, 9.81),
                angular_velocity: Vector3::new(0.01 * i as f64, 0.0, 0.0),
                time,
                replay,
            });
            time += interval;
        }
        Self {
            readings: Mutex::new(readings),
        }
    }
}

impl TimedImuSensor for MockImuSensor {
    fn next_reading(&self, _ctx: &SensorContext) -> Result<TimedImuReading, CoreError> {
        match self.readings.lock().unwrap().pop_front() {
            Some(reading) => Ok(reading),
            None => Err(CoreError::EndOfStream),
        }
    }
}

/// How many upcoming calls to a stream should report `LockContention`
/// before the next one succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentionPolicy {
    pub lidar_fail_first_n_per_reading: usize,
    pub imu_fail_first_n_per_reading: usize,
}

#[derive(Default)]
struct MockState {
    lidar_submissions: Vec<(String, DateTime<Utc>)>,
    imu_submissions: Vec<(String, DateTime<Utc>)>,
    total_points: usize,
    lidar_failures_remaining: usize,
    lidar_attempt_time: Option<DateTime<Utc>>,
    imu_failures_remaining: usize,
    imu_attempt_time: Option<DateTime<Utc>>,
    snapshot_count: usize,
    latest_map_info: Option<DateTime<Utc>>,
}

/// An in-memory stand-in for the native engine, recording every
/// submission it receives and optionally simulating lock contention.
pub struct MockCartoFacade {
    state: Mutex<MockState>,
    policy: ContentionPolicy,
    /// Whether `add_lidar` advances `latest_map_info`. Real engines
    /// freeze the map (but keep tracking) while localizing; this lets
    /// a test stand in for that without modeling the whole engine.
    freeze_map_info: bool,
}

impl MockCartoFacade {
    pub fn new(policy: ContentionPolicy) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            policy,
            freeze_map_info: false,
        }
    }

    /// Like [`MockCartoFacade::new`], but `latest_map_info` never
    /// advances past its initial value once set — for simulating a
    /// `Localizing` engine.
    pub fn new_localizing(policy: ContentionPolicy) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            policy,
            freeze_map_info: true,
        }
    }

    pub fn lidar_submissions(&self) -> Vec<(String, DateTime<Utc>)> {
        self.state.lock().unwrap().lidar_submissions.clone()
    }

    pub fn imu_submissions(&self) -> Vec<(String, DateTime<Utc>)> {
        self.state.lock().unwrap().imu_submissions.clone()
    }

    pub fn total_points(&self) -> usize {
        self.state.lock().unwrap().total_points
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshot_count
    }

    pub fn record_snapshot_taken(&self) {
        self.state.lock().unwrap().snapshot_count += 1;
    }
}

impl CartoFacade for MockCartoFacade {
    fn add_lidar(
        &self,
        name: &str,
        pcd: &[u8],
        time: DateTime<Utc>,
        _deadline: Duration,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        // A new distinct reading (different stamp than the one currently
        // being retried) gets a fresh failure budget; retries of the same
        // reading keep drawing down the budget set when it first arrived.
        if state.lidar_attempt_time != Some(time) {
            state.lidar_attempt_time = Some(time);
            state.lidar_failures_remaining = self.policy.lidar_fail_first_n_per_reading;
        }
        if state.lidar_failures_remaining > 0 {
            state.lidar_failures_remaining -= 1;
            return Err(CoreError::LockContention);
        }
        state.lidar_submissions.push((name.to_string(), time));
        state.total_points += pcd_point_count(pcd);
        if !self.freeze_map_info || state.latest_map_info.is_none() {
            state.latest_map_info = Some(time);
        }
        Ok(())
    }

    fn add_imu(
        &self,
        name: &str,
        _linear_acceleration: Vector3,
        _angular_velocity: Vector3,
        time: DateTime<Utc>,
        _deadline: Duration,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        if state.imu_attempt_time != Some(time) {
            state.imu_attempt_time = Some(time);
            state.imu_failures_remaining = self.policy.imu_fail_first_n_per_reading;
        }
        if state.imu_failures_remaining > 0 {
            state.imu_failures_remaining -= 1;
            return Err(CoreError::LockContention);
        }
        state.imu_submissions.push((name.to_string(), time));
        Ok(())
    }

    fn position(&self) -> Result<PositionResponse, CoreError> {
        Ok(PositionResponse {
            pose: Pose::default(),
            component_reference: "mock_lidar".into(),
        })
    }

    fn point_cloud_map(&self) -> Result<Vec<u8>, CoreError> {
        Ok(make_pcd(self.total_points()))
    }

    fn internal_state(&self) -> Result<Vec<u8>, CoreError> {
        self.record_snapshot_taken();
        Ok(b"mock-internal-state".to_vec())
    }

    fn latest_map_info(&self) -> Result<DateTime<Utc>, CoreError> {
        self.state
            .lock()
            .unwrap()
            .latest_map_info
            .ok_or_else(|| CoreError::Native("no map info yet".into()))
    }

    fn run_optimization(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_lidar_sensor_ends_after_scripted_count() {
        let sensor = MockLidarSensor::new(2, Utc::now(), Duration::from_millis(10), 5, true);
        let ctx = SensorContext::new();
        assert!(sensor.next_reading(&ctx).is_ok());
        assert!(sensor.next_reading(&ctx).is_ok());
        assert!(sensor.next_reading(&ctx).unwrap_err().is_end_of_stream());
    }

    #[test]
    fn mock_facade_retries_succeed_after_n_failures() {
        let facade = MockCartoFacade::new(ContentionPolicy {
            lidar_fail_first_n_per_reading: 2,
            imu_fail_first_n_per_reading: 0,
        });
        let t = Utc::now();
        assert!(matches!(
            facade.add_lidar("lidar", &make_pcd(1), t, Duration::from_secs(1)),
            Err(CoreError::LockContention)
        ));
        assert!(matches!(
            facade.add_lidar("lidar", &make_pcd(1), t, Duration::from_secs(1)),
            Err(CoreError::LockContention)
        ));
        assert!(facade
            .add_lidar("lidar", &make_pcd(1), t, Duration::from_secs(1))
            .is_ok());
        assert_eq!(facade.lidar_submissions().len(), 1);
    }
}
