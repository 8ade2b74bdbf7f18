//! Operational counters. Per spec §9 Open Questions, `LockContention`
//! is treated as a metric, not a contract: it is observable here but
//! is not part of the host service API in §6.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    lidar_submitted: AtomicU64,
    lidar_lock_contention: AtomicU64,
    lidar_skipped: AtomicU64,
    imu_submitted: AtomicU64,
    imu_lock_contention: AtomicU64,
    imu_skipped: AtomicU64,
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub lidar_submitted: u64,
    pub lidar_lock_contention: u64,
    pub lidar_skipped: u64,
    pub imu_submitted: u64,
    pub imu_lock_contention: u64,
    pub imu_skipped: u64,
}

impl Metrics {
    pub fn record_lidar_submitted(&self) {
        self.lidar_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lidar_lock_contention(&self) {
        self.lidar_lock_contention.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lidar_skipped(&self) {
        self.lidar_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_imu_submitted(&self) {
        self.imu_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_imu_lock_contention(&self) {
        self.imu_lock_contention.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_imu_skipped(&self) {
        self.imu_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lidar_submitted: self.lidar_submitted.load(Ordering::Relaxed),
            lidar_lock_contention: self.lidar_lock_contention.load(Ordering::Relaxed),
            lidar_skipped: self.lidar_skipped.load(Ordering::Relaxed),
            imu_submitted: self.imu_submitted.load(Ordering::Relaxed),
            imu_lock_contention: self.imu_lock_contention.load(Ordering::Relaxed),
            imu_skipped: self.imu_skipped.load(Ordering::Relaxed),
        }
    }
}
