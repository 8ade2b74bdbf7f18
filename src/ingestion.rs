//! Lidar (C3) and IMU (C4) ingestion loops.
//!
//! Each loop repeatedly pulls the next reading from its sensor
//! binding, waits for the interleave coordinator to admit it, submits
//! it to the engine facade, and applies the online/offline
//! back-pressure policy. Both loops run on a dedicated `std::thread`,
//! mirroring the teacher's blocking producer-thread pattern.

use std::time::{Duration, Instant};

use crate::clock::Coordinator;
use crate::engine::CartoFacade;
use crate::error::CoreError;
use crate::metrics::Metrics;
use crate::sensor::{ImuBinding, LidarBinding, SensorContext};

/// Runs the lidar ingestion loop until cancelled or the stream ends.
#[allow(clippy::too_many_arguments)]
pub fn run_lidar_loop(
    lidar: &LidarBinding,
    facade: &dyn CartoFacade,
    coordinator: &Coordinator,
    metrics: &Metrics,
    use_live_data: bool,
    data_interval: Duration,
    deadline: Duration,
    ctx: &SensorContext,
) {
    loop {
        if ctx.is_cancelled() {
            tracing::info!("lidar loop observed cancellation, exiting");
            return;
        }

        let reading = match lidar.next_reading(ctx) {
            Ok(reading) => reading,
            Err(err) if err.is_end_of_stream() => {
                tracing::info!("lidar stream ended");
                coordinator.mark_lidar_stream_ended();
                return;
            }
            Err(CoreError::Cancelled) => {
                tracing::info!("lidar loop observed cancellation while reading, exiting");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping lidar reading due to read error");
                continue;
            }
        };

        if let Err(err) = coordinator.wait_for_lidar_admission(reading.time, ctx) {
            tracing::info!(error = %err, "lidar loop exiting while waiting for admission");
            return;
        }

        if use_live_data {
            let started_at = Instant::now();
            match facade.add_lidar(&lidar.name, &reading.pcd, reading.time, deadline) {
                Ok(()) => {
                    metrics.record_lidar_submitted();
                    coordinator.record_lidar_submission(reading.time);
                }
                Err(CoreError::LockContention) => {
                    tracing::debug!("skipping lidar reading due to lock contention");
                    metrics.record_lidar_lock_contention();
                    metrics.record_lidar_skipped();
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping lidar reading due to engine error");
                    metrics.record_lidar_skipped();
                }
            }
            // Online back-pressure: never retry this reading; sleep out
            // the remainder of the configured interval.
            let elapsed = started_at.elapsed();
            let sleep_for = data_interval.saturating_sub(elapsed);
            if !sleep_for.is_zero() {
                std::thread::sleep(sleep_for);
            }
        } else {
            // Offline: retry the same reading on lock contention only,
            // tight-looped, gated by cancellation. Never sleep.
            loop {
                if ctx.is_cancelled() {
                    tracing::info!("lidar loop observed cancellation during retry, exiting");
                    return;
                }
                match facade.add_lidar(&lidar.name, &reading.pcd, reading.time, deadline) {
                    Ok(()) => {
                        metrics.record_lidar_submitted();
                        coordinator.record_lidar_submission(reading.time);
                        break;
                    }
                    Err(CoreError::LockContention) => {
                        metrics.record_lidar_lock_contention();
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping lidar reading due to engine error");
                        metrics.record_lidar_skipped();
                        break;
                    }
                }
            }
        }
    }
}

/// Runs the IMU ingestion loop until cancelled, the lidar stream ends,
/// or its own stream ends.
#[allow(clippy::too_many_arguments)]
pub fn run_imu_loop(
    imu: &ImuBinding,
    facade: &dyn CartoFacade,
    coordinator: &Coordinator,
    metrics: &Metrics,
    use_live_data: bool,
    data_interval: Duration,
    deadline: Duration,
    ctx: &SensorContext,
) {
    loop {
        if ctx.is_cancelled() {
            tracing::info!("imu loop observed cancellation, exiting");
            return;
        }

        let reading = match imu.next_reading(ctx) {
            Ok(reading) => reading,
            Err(err) if err.is_end_of_stream() => {
                tracing::info!("imu stream ended");
                return;
            }
            Err(CoreError::Cancelled) => {
                tracing::info!("imu loop observed cancellation while reading, exiting");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "skipping imu reading due to read error");
                continue;
            }
        };

        match coordinator.wait_for_imu_admission(reading.time, ctx) {
            Ok(()) => {}
            Err(err) if err.is_end_of_stream() => {
                tracing::info!("imu loop terminating: lidar stream has ended");
                return;
            }
            Err(err) => {
                tracing::info!(error = %err, "imu loop exiting while waiting for admission");
                return;
            }
        }

        if use_live_data {
            let started_at = Instant::now();
            match facade.add_imu(
                &imu.name,
                reading.linear_acceleration,
                reading.angular_velocity,
                reading.time,
                deadline,
            ) {
                Ok(()) => {
                    metrics.record_imu_submitted();
                    coordinator.record_imu_submission(reading.time);
                }
                Err(CoreError::LockContention) => {
                    tracing::debug!("skipping imu reading due to lock contention");
                    metrics.record_imu_lock_contention();
                    metrics.record_imu_skipped();
                }
                Err(err) => {
                    tracing::warn!(error = %err, "skipping imu reading due to engine error");
                    metrics.record_imu_skipped();
                }
            }
            let elapsed = started_at.elapsed();
            let sleep_for = data_interval.saturating_sub(elapsed);
            if !sleep_for.is_zero() {
                std::thread::sleep(sleep_for);
            }
        } else {
            loop {
                if ctx.is_cancelled() {
                    tracing::info!("imu loop observed cancellation during retry, exiting");
                    return;
                }
                match facade.add_imu(
                    &imu.name,
                    reading.linear_acceleration,
                    reading.angular_velocity,
                    reading.time,
                    deadline,
                ) {
                    Ok(()) => {
                        metrics.record_imu_submitted();
                        coordinator.record_imu_submission(reading.time);
                        break;
                    }
                    Err(CoreError::LockContention) => {
                        metrics.record_imu_lock_contention();
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping imu reading due to engine error");
                        metrics.record_imu_skipped();
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::LidarCapabilities;
    use crate::testutil::{ContentionPolicy, MockCartoFacade, MockLidarSensor};
    use chrono::Utc;

    /// Property 4: in online mode, a reading that hits lock contention is
    /// never retried — the loop advances one reading per iteration, so the
    /// engine sees fewer submissions than readings produced.
    #[test]
    fn online_mode_skips_contended_readings_without_retrying() {
        let start = Utc::now();
        let lidar = LidarBinding::new(
            "lidar0",
            MockLidarSensor::new(5, start, Duration::from_millis(5), 3, true),
            LidarCapabilities { supports_pcd: true },
        )
        .unwrap();
        // Every reading is "new" (distinct stamp), so a per-reading budget
        // of 1 means the loop's single online attempt always fails.
        let facade = MockCartoFacade::new(ContentionPolicy {
            lidar_fail_first_n_per_reading: 1,
            imu_fail_first_n_per_reading: 0,
        });
        let coordinator = Coordinator::new(false, Duration::from_millis(5), Duration::from_millis(5));
        let metrics = Metrics::default();
        let ctx = SensorContext::new();

        run_lidar_loop(
            &lidar,
            &facade,
            &coordinator,
            &metrics,
            true,
            Duration::from_millis(1),
            Duration::from_secs(1),
            &ctx,
        );

        assert_eq!(facade.lidar_submissions().len(), 0);
        assert_eq!(metrics.snapshot().lidar_skipped, 5);
        assert_eq!(metrics.snapshot().lidar_lock_contention, 5);
    }

    /// Property 5: in offline mode, lock contention on the first N attempts
    /// per reading still ends with every reading submitted exactly once and
    /// in order.
    #[test]
    fn offline_mode_retries_until_each_reading_is_submitted_once_in_order() {
        let start = Utc::now();
        let lidar = LidarBinding::new(
            "lidar0",
            MockLidarSensor::new(6, start, Duration::from_millis(10), 2, true),
            LidarCapabilities { supports_pcd: true },
        )
        .unwrap();
        let facade = MockCartoFacade::new(ContentionPolicy {
            lidar_fail_first_n_per_reading: 3,
            imu_fail_first_n_per_reading: 0,
        });
        let coordinator = Coordinator::new(false, Duration::from_millis(10), Duration::from_millis(10));
        let metrics = Metrics::default();
        let ctx = SensorContext::new();

        run_lidar_loop(
            &lidar,
            &facade,
            &coordinator,
            &metrics,
            false,
            Duration::from_millis(10),
            Duration::from_secs(1),
            &ctx,
        );

        let submissions = facade.lidar_submissions();
        assert_eq!(submissions.len(), 6, "every reading must eventually land exactly once");
        let times: Vec<_> = submissions.iter().map(|(_, t)| *t).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted, "readings must be submitted in order");
        assert_eq!(metrics.snapshot().lidar_lock_contention, 6 * 3);
    }
}
