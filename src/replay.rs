//! File-backed replay sensors (ambient, supports C10).
//!
//! A replay source reads a manifest of previously captured readings
//! instead of a live driver. This mirrors how the original
//! implementation threads a replay sensor's recorded RFC3339Nano
//! timestamp through request metadata (`sensorprocess.AddSensorReading`)
//! rather than stamping with wall-clock time; here the manifest plays
//! the same role the metadata key does there.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;

use crate::error::CoreError;
use crate::sensor::{
    parse_replay_timestamp, SensorContext, TimedImuReading, TimedImuSensor, TimedLidarReading,
    TimedLidarSensor, Vector3,
};

#[derive(Debug, Deserialize)]
struct LidarManifestEntry {
    file: String,
    time: String,
}

#[derive(Debug, Deserialize)]
struct ImuManifestEntry {
    time: String,
    linear_acceleration: [f64; 3],
    angular_velocity: [f64; 3],
}

/// Replays lidar readings from `<data_dir>/manifest.json`, an ordered
/// array of `{"file": "0.pcd", "time": "<RFC3339Nano>"}` entries. Point
/// cloud bytes are read from disk lazily, one reading ahead of the
/// cursor.
pub struct ReplayLidarSensor {
    dir: PathBuf,
    entries: Vec<LidarManifestEntry>,
    cursor: Mutex<usize>,
}

impl ReplayLidarSensor {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        let manifest = std::fs::read_to_string(dir.join("manifest.json"))?;
        let entries: Vec<LidarManifestEntry> = serde_json::from_str(&manifest)?;
        Ok(Self {
            dir,
            entries,
            cursor: Mutex::new(0),
        })
    }
}

impl TimedLidarSensor for ReplayLidarSensor {
    fn next_reading(&self, _ctx: &SensorContext) -> Result<TimedLidarReading, CoreError> {
        let mut cursor = self.cursor.lock().unwrap();
        let Some(entry) = self.entries.get(*cursor) else {
            return Err(CoreError::EndOfStream);
        };
        let time = parse_replay_timestamp(&entry.time)?;
        let pcd = std::fs::read(self.dir.join(&entry.file))?;
        *cursor += 1;
        Ok(TimedLidarReading {
            pcd,
            time,
            replay: true,
        })
    }
}

/// Replays IMU readings from `<data_dir>/manifest.json`, an ordered
/// array of `{"time", "linear_acceleration": [x,y,z], "angular_velocity": [x,y,z]}`
/// entries, already in radians/second.
pub struct ReplayImuSensor {
    entries: Vec<ImuManifestEntry>,
    cursor: Mutex<usize>,
}

impl ReplayImuSensor {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CoreError> {
        let manifest = std::fs::read_to_string(dir.as_ref().join("manifest.json"))?;
        let entries: Vec<ImuManifestEntry> = serde_json::from_str(&manifest)?;
        Ok(Self {
            entries,
            cursor: Mutex::new(0),
        })
    }
}

impl TimedImuSensor for ReplayImuSensor {
    fn next_reading(&self, _ctx: &SensorContext) -> Result<TimedImuReading, CoreError> {
        let mut cursor = self.cursor.lock().unwrap();
        let Some(entry) = self.entries.get(*cursor) else {
            return Err(CoreError::EndOfStream);
        };
        let time = parse_replay_timestamp(&entry.time)?;
        let [ax, ay, az] = entry.linear_acceleration;
        let [gx, gy, gz] = entry.angular_velocity;
        *cursor += 1;
        Ok(TimedImuReading {
            linear_acceleration: Vector3::new(ax, ay, az),
            angular_velocity: Vector3::new(gx, gy, gz),
            time,
            replay: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_lidar_reads_manifest_in_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.pcd"), b"pcd-0").unwrap();
        std::fs::write(dir.path().join("1.pcd"), b"pcd-1").unwrap();
        std::fs::write(
            dir.path().join("manifest.json"),
            r#"[
                {"file": "0.pcd", "time": "2024-01-01T00:00:00.000000000Z"},
                {"file": "1.pcd", "time": "2024-01-01T00:00:01.000000000Z"}
            ]"#,
        )
        .unwrap();

        let sensor = ReplayLidarSensor::open(dir.path()).unwrap();
        let ctx = SensorContext::new();
        let first = sensor.next_reading(&ctx).unwrap();
        assert_eq!(first.pcd, b"pcd-0");
        let second = sensor.next_reading(&ctx).unwrap();
        assert_eq!(second.pcd, b"pcd-1");
        assert!(sensor.next_reading(&ctx).unwrap_err().is_end_of_stream());
    }

    #[test]
    fn replay_imu_parses_vectors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.json"),
            r#"[
                {"time": "2024-01-01T00:00:00.000000000Z", "linear_acceleration": [0.0, 0.0, 9.81], "angular_velocity": [0.0, 0.0, 0.0]}
            ]"#,
        )
        .unwrap();
        let sensor = ReplayImuSensor::open(dir.path()).unwrap();
        let ctx = SensorContext::new();
        let reading = sensor.next_reading(&ctx).unwrap();
        assert_eq!(reading.linear_acceleration.z, 9.81);
    }
}
