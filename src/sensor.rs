//! Timed Sensor Interface (C1).
//!
//! A uniform blocking contract for producing the next timestamped
//! reading from a live or replay source, plus the capability-checked
//! bindings that the rest of the crate is built against.

use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Observed by every blocking suspension point in a producer loop.
/// Cheap to clone; all clones share the same cancellation flag.
#[derive(Clone)]
pub struct SensorContext {
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl SensorContext {
    pub fn new() -> Self {
        Self {
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Default for SensorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A 3-vector, used for both linear acceleration (m/s^2) and angular
/// velocity (rad/s, after conversion).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn to_radians(self) -> Self {
        Self {
            x: self.x.to_radians(),
            y: self.y.to_radians(),
            z: self.z.to_radians(),
        }
    }
}

/// A timestamped point cloud, serialized as binary PCD.
#[derive(Debug, Clone)]
pub struct TimedLidarReading {
    pub pcd: Vec<u8>,
    pub time: DateTime<Utc>,
    /// Whether `time` was assigned by a replay source (authoritative)
    /// or by live wall-clock (advisory).
    pub replay: bool,
}

/// A timestamped pair of 3-vectors: linear acceleration and angular
/// velocity. Angular velocity here is always radians/second; degrees/s
/// sources are converted at the binding layer.
#[derive(Debug, Clone)]
pub struct TimedImuReading {
    pub linear_acceleration: Vector3,
    pub angular_velocity: Vector3,
    pub time: DateTime<Utc>,
    pub replay: bool,
}

/// Parses the RFC 3339 nanosecond timestamps carried in replay sensor
/// metadata. Failure here fails the call, never the owning loop.
pub fn parse_replay_timestamp(raw: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| {
            CoreError::SensorValidation(format!(
                "malformed replay timestamp {raw:?}: {err}"
            ))
        })
}

/// Blocks until a lidar reading is available or `ctx` is cancelled.
pub trait TimedLidarSensor: Send + Sync {
    fn next_reading(&self, ctx: &SensorContext) -> Result<TimedLidarReading, CoreError>;
}

/// Blocks until an IMU reading is available or `ctx` is cancelled.
pub trait TimedImuSensor: Send + Sync {
    fn next_reading(&self, ctx: &SensorContext) -> Result<TimedImuReading, CoreError>;
}

/// What a candidate lidar source can do. A lidar must support
/// point-cloud output.
#[derive(Debug, Clone, Copy, Default)]
pub struct LidarCapabilities {
    pub supports_pcd: bool,
}

/// What a candidate IMU source can do. An IMU must support *both*
/// linear acceleration and angular velocity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImuCapabilities {
    pub supports_linear_acceleration: bool,
    pub supports_angular_velocity: bool,
}

/// The unit angular velocity arrives in from the underlying driver.
/// Degrees/s sources are converted to radians/s once, here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngularVelocityUnit {
    RadiansPerSecond,
    DegreesPerSecond,
}

/// A capability-checked lidar binding. Construction fails at
/// configuration time if the underlying source lacks PCD support.
/// Held behind an `Arc` so the owning producer thread can share it
/// with the service without borrowing across the thread boundary.
#[derive(Clone)]
pub struct LidarBinding {
    pub name: String,
    sensor: std::sync::Arc<dyn TimedLidarSensor>,
}

impl LidarBinding {
    pub fn new(
        name: impl Into<String>,
        sensor: impl TimedLidarSensor + 'static,
        capabilities: LidarCapabilities,
    ) -> Result<Self, CoreError> {
        let name = name.into();
        if !capabilities.supports_pcd {
            return Err(CoreError::SensorValidation(format!(
                "lidar {name:?} does not support point-cloud output"
            )));
        }
        Ok(Self {
            name,
            sensor: std::sync::Arc::new(sensor),
        })
    }

    pub fn next_reading(&self, ctx: &SensorContext) -> Result<TimedLidarReading, CoreError> {
        self.sensor.next_reading(ctx)
    }
}

/// A capability-checked IMU binding that additionally normalizes
/// angular velocity to radians/second.
#[derive(Clone)]
pub struct ImuBinding {
    pub name: String,
    sensor: std::sync::Arc<dyn TimedImuSensor>,
    angular_velocity_unit: AngularVelocityUnit,
}

impl ImuBinding {
    pub fn new(
        name: impl Into<String>,
        sensor: impl TimedImuSensor + 'static,
        capabilities: ImuCapabilities,
        angular_velocity_unit: AngularVelocityUnit,
    ) -> Result<Self, CoreError> {
        let name = name.into();
        if !capabilities.supports_linear_acceleration || !capabilities.supports_angular_velocity {
            return Err(CoreError::SensorValidation(format!(
                "movement sensor {name:?} must support both linear acceleration and angular velocity"
            )));
        }
        Ok(Self {
            name,
            sensor: std::sync::Arc::new(sensor),
            angular_velocity_unit,
        })
    }

    pub fn next_reading(&self, ctx: &SensorContext) -> Result<TimedImuReading, CoreError> {
        let mut reading = self.sensor.next_reading(ctx)?;
        if self.angular_velocity_unit == AngularVelocityUnit::DegreesPerSecond {
            reading.angular_velocity = reading.angular_velocity.to_radians();
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrees_to_radians_conversion_happens_once_at_binding() {
        struct Fixed;
        impl TimedImuSensor for Fixed {
            fn next_reading(&self, _ctx: &SensorContext) -> Result<TimedImuReading, CoreError> {
                Ok(TimedImuReading {
                    linear_acceleration: Vector3::default(),
                    angular_velocity: Vector3::new(180.0, 90.0, 0.0),
                    time: Utc::now(),
                    replay: false,
                })
            }
        }

        let binding = ImuBinding::new(
            "imu",
            Fixed,
            ImuCapabilities {
                supports_linear_acceleration: true,
                supports_angular_velocity: true,
            },
            AngularVelocityUnit::DegreesPerSecond,
        )
        .unwrap();

        let ctx = SensorContext::new();
        let reading = binding.next_reading(&ctx).unwrap();
        assert!((reading.angular_velocity.x - std::f64::consts::PI).abs() < 1e-9);
        assert!((reading.angular_velocity.y - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn lidar_binding_rejects_missing_pcd_capability() {
        struct Noop;
        impl TimedLidarSensor for Noop {
            fn next_reading(&self, _ctx: &SensorContext) -> Result<TimedLidarReading, CoreError> {
                unreachable!()
            }
        }
        let err = LidarBinding::new("cam", Noop, LidarCapabilities { supports_pcd: false })
            .unwrap_err();
        assert!(matches!(err, CoreError::SensorValidation(_)));
    }

    #[test]
    fn imu_binding_requires_both_capabilities() {
        struct Noop;
        impl TimedImuSensor for Noop {
            fn next_reading(&self, _ctx: &SensorContext) -> Result<TimedImuReading, CoreError> {
                unreachable!()
            }
        }
        let err = ImuBinding::new(
            "imu",
            Noop,
            ImuCapabilities {
                supports_linear_acceleration: true,
                supports_angular_velocity: false,
            },
            AngularVelocityUnit::RadiansPerSecond,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::SensorValidation(_)));
    }

    #[test]
    fn replay_timestamp_parse_failure_is_not_panic() {
        let err = parse_replay_timestamp("not-a-timestamp").unwrap_err();
        assert!(matches!(err, CoreError::SensorValidation(_)));
    }

    #[test]
    fn replay_timestamp_parses_nanosecond_precision() {
        let dt = parse_replay_timestamp("2024-01-02T03:04:05.123456789Z").unwrap();
        assert_eq!(dt.timestamp_subsec_nanos(), 123456789);
    }
}
