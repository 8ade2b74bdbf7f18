//! Temporal Interleave Coordinator (C5).
//!
//! Shared clock state enforcing that IMU readings remain ahead of the
//! next lidar reading, so the engine always receives IMU samples
//! bracketing each lidar sample. A single mutex protects the clock
//! fields; a condvar notifies waiters on every mutation so the 100ms
//! poll below is a safety net, not the primary wakeup path.

use std::sync::{Condvar, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::sensor::SensorContext;

/// Fallback re-check period for a producer blocked on admission.
/// Busy spins are forbidden; this bounds how long a cancellation or a
/// state change can go unnoticed if the condvar notification is missed.
const ADMISSION_POLL_INTERVAL: StdDuration = StdDuration::from_millis(100);

#[derive(Debug, Default, Clone, Copy)]
struct ClockState {
    lidar_t: Option<DateTime<Utc>>,
    next_lidar_t: Option<DateTime<Utc>>,
    imu_t: Option<DateTime<Utc>>,
    next_imu_t: Option<DateTime<Utc>>,
    last_lidar_t: Option<DateTime<Utc>>,
}

pub struct Coordinator {
    state: Mutex<ClockState>,
    condvar: Condvar,
    has_imu: bool,
    lidar_interval: chrono::Duration,
    imu_interval: chrono::Duration,
}

impl Coordinator {
    pub fn new(has_imu: bool, lidar_interval: StdDuration, imu_interval: StdDuration) -> Self {
        Self {
            state: Mutex::new(ClockState::default()),
            condvar: Condvar::new(),
            has_imu,
            lidar_interval: chrono::Duration::from_std(lidar_interval)
                .unwrap_or(chrono::Duration::zero()),
            imu_interval: chrono::Duration::from_std(imu_interval)
                .unwrap_or(chrono::Duration::zero()),
        }
    }

    /// Blocks until admitting a lidar reading stamped `candidate_time`
    /// is allowed, or cancellation is observed. No-op when no IMU is
    /// configured.
    pub fn wait_for_lidar_admission(
        &self,
        candidate_time: DateTime<Utc>,
        ctx: &SensorContext,
    ) -> Result<(), CoreError> {
        if !self.has_imu {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        loop {
            if ctx.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let admitted = match state.next_imu_t {
                None => true,
                Some(next_imu_t) => candidate_time <= next_imu_t,
            };
            if admitted {
                return Ok(());
            }
            let (guard, _timeout) = self
                .condvar
                .wait_timeout(state, ADMISSION_POLL_INTERVAL)
                .unwrap();
            state = guard;
        }
    }

    /// Blocks until admitting an IMU reading stamped `candidate_time`
    /// is allowed, returns `EndOfStream` once the lidar stream has
    /// terminated, or observes cancellation.
    pub fn wait_for_imu_admission(
        &self,
        candidate_time: DateTime<Utc>,
        ctx: &SensorContext,
    ) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if ctx.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            if state.last_lidar_t.is_some() {
                return Err(CoreError::EndOfStream);
            }
            let admitted = match state.next_lidar_t {
                None => true,
                Some(next_lidar_t) => candidate_time < next_lidar_t,
            };
            if admitted {
                return Ok(());
            }
            let (guard, _timeout) = self
                .condvar
                .wait_timeout(state, ADMISSION_POLL_INTERVAL)
                .unwrap();
            state = guard;
        }
    }

    /// Advances the lidar clock after a successful submission.
    pub fn record_lidar_submission(&self, time: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.lidar_t = Some(time);
        state.next_lidar_t = Some(time + self.lidar_interval);
        drop(state);
        self.condvar.notify_all();
    }

    /// Advances the IMU clock after a successful submission.
    pub fn record_imu_submission(&self, time: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.imu_t = Some(time);
        state.next_imu_t = Some(time + self.imu_interval);
        drop(state);
        self.condvar.notify_all();
    }

    /// Called once by the lidar loop when its stream ends, so the IMU
    /// loop terminates on its next admission check.
    pub fn mark_lidar_stream_ended(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_lidar_t = Some(state.lidar_t.unwrap_or_else(Utc::now));
        drop(state);
        self.condvar.notify_all();
    }

    pub fn has_imu(&self) -> bool {
        self.has_imu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn t(offset_ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
            + chrono::Duration::milliseconds(offset_ms)
    }

    #[test]
    fn lidar_admitted_before_any_imu_recorded() {
        let coord = Coordinator::new(true, Duration::from_millis(200), Duration::from_millis(50));
        let ctx = SensorContext::new();
        assert!(coord.wait_for_lidar_admission(t(0), &ctx).is_ok());
    }

    #[test]
    fn lidar_blocked_when_imu_not_caught_up_and_cancellation_unblocks_it() {
        let coord = std::sync::Arc::new(Coordinator::new(
            true,
            Duration::from_millis(200),
            Duration::from_millis(50),
        ));
        coord.record_imu_submission(t(0));
        // next_imu_t = 50ms; candidate lidar at 500ms is far ahead -> blocked.
        let ctx = SensorContext::new();
        let ctx_clone = ctx.clone();
        let coord_clone = coord.clone();
        let handle =
            std::thread::spawn(move || coord_clone.wait_for_lidar_admission(t(500), &ctx_clone));
        std::thread::sleep(Duration::from_millis(150));
        ctx.cancel();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[test]
    fn no_imu_configured_degrades_lidar_path_to_noop() {
        let coord = Coordinator::new(false, Duration::from_millis(200), Duration::from_millis(50));
        let ctx = SensorContext::new();
        assert!(coord.wait_for_lidar_admission(t(10_000), &ctx).is_ok());
    }

    #[test]
    fn imu_terminates_after_lidar_marks_end() {
        let coord = Coordinator::new(true, Duration::from_millis(200), Duration::from_millis(50));
        coord.mark_lidar_stream_ended();
        let ctx = SensorContext::new();
        let err = coord.wait_for_imu_admission(t(0), &ctx).unwrap_err();
        assert!(err.is_end_of_stream());
    }

    #[test]
    fn imu_admitted_while_ahead_of_next_lidar_boundary() {
        let coord = Coordinator::new(true, Duration::from_millis(200), Duration::from_millis(50));
        coord.record_lidar_submission(t(0));
        let ctx = SensorContext::new();
        // next_lidar_t = 200ms; candidate imu at 150ms < 200ms -> admitted.
        assert!(coord.wait_for_imu_admission(t(150), &ctx).is_ok());
    }
}
