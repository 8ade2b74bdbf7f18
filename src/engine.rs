//! Engine Facade (C2).
//!
//! A thin, thread-safe wrapper over the native mapping/localization
//! engine. The engine itself is an opaque FFI library: this module
//! only ever calls through the small surface named below, and is the
//! sole place in the crate that touches `unsafe`.

#[cfg(feature = "native-engine")]
use std::ffi::c_void;
use std::sync::mpsc;
#[cfg(feature = "native-engine")]
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{OperatingMode, ResolvedConfig};
use crate::error::CoreError;
use crate::sensor::Vector3;

/// A 3D point plus orientation (axis-angle), as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub position: Vector3,
    /// Axis-angle orientation: unit axis (x, y, z) and angle in radians.
    pub axis: Vector3,
    pub angle: f64,
}

#[derive(Debug, Clone)]
pub struct PositionResponse {
    pub pose: Pose,
    /// Name of the lidar binding this pose is reported relative to.
    pub component_reference: String,
}

/// The call surface required of any backend behind the facade.
/// Implementations own their own internal locking; `LockContention`
/// and `Deadline` are distinguishable so ingestion loops can apply
/// skip/retry policy without inspecting error strings.
pub trait CartoFacade: Send + Sync {
    fn add_lidar(
        &self,
        name: &str,
        pcd: &[u8],
        time: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<(), CoreError>;

    fn add_imu(
        &self,
        name: &str,
        linear_acceleration: Vector3,
        angular_velocity: Vector3,
        time: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<(), CoreError>;

    fn position(&self) -> Result<PositionResponse, CoreError>;
    fn point_cloud_map(&self) -> Result<Vec<u8>, CoreError>;
    fn internal_state(&self) -> Result<Vec<u8>, CoreError>;
    fn latest_map_info(&self) -> Result<DateTime<Utc>, CoreError>;
    fn run_optimization(&self) -> Result<(), CoreError>;
    fn stop(&self) -> Result<(), CoreError>;
}

/// Runs `f` on a dedicated worker thread and bounds it by `deadline`.
/// The native ABI is not assumed to honor cancellation: a timed-out
/// call is reported distinctly and the worker thread is left to run
/// to completion in the background, never joined on the hot path.
fn call_with_deadline<T, F>(deadline: Duration, f: F) -> Result<T, CoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CoreError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    match rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(CoreError::Deadline(deadline)),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(CoreError::Native("engine worker thread panicked".into()))
        }
    }
}

/// Process-scoped reference count around the native library's
/// init/terminate pair, so multiple service instances in one process
/// share a single initialized library.
///
/// Everything below this point links against the native `carto`
/// library and is gated behind the `native-engine` feature, which is
/// off by default: the engine's ABI is out of this crate's scope
/// (spec §1), and there is no fabricated `-sys` crate or `build.rs`
/// standing in for it. Enable the feature only when building against
/// an environment that actually provides the native library; the
/// `carto-ingest` binary target requires it (see `Cargo.toml`).
#[cfg(feature = "native-engine")]
static NATIVE_LIB_REFCOUNT: Mutex<usize> = Mutex::new(0);

#[cfg(feature = "native-engine")]
fn acquire_native_library() -> Result<(), CoreError> {
    let mut count = NATIVE_LIB_REFCOUNT.lock().unwrap();
    if *count == 0 {
        // SAFETY: only called while holding the refcount lock, and
        // only when transitioning 0 -> 1, so this can never race with
        // `carto_terminate_lib`.
        let rc = unsafe { sys::carto_init_lib() };
        if rc != 0 {
            return Err(CoreError::Native(format!(
                "native library initialization failed with code {rc}"
            )));
        }
    }
    *count += 1;
    Ok(())
}

#[cfg(feature = "native-engine")]
fn release_native_library() {
    let mut count = NATIVE_LIB_REFCOUNT.lock().unwrap();
    if *count == 0 {
        return;
    }
    *count -= 1;
    if *count == 0 {
        // SAFETY: only called while holding the refcount lock, and
        // only when transitioning 1 -> 0.
        unsafe { sys::carto_terminate_lib() };
    }
}

/// Raw FFI surface. The native library is linked externally; this
/// module declares only the operations the facade calls through.
#[cfg(feature = "native-engine")]
mod sys {
    use std::os::raw::c_int;

    pub type CartoHandle = *mut std::ffi::c_void;

    extern "C" {
        pub fn carto_init_lib() -> c_int;
        pub fn carto_terminate_lib();
    }
}

/// Opaque handle to a running engine instance. The native library
/// guarantees `add_lidar`/`add_imu` are thread-safe, so a raw pointer
/// can be shared across the producer threads.
#[cfg(feature = "native-engine")]
struct EngineHandle(sys::CartoHandle);

// SAFETY: the native engine contract (spec §6) requires thread-safe
// add_lidar/add_imu and readers safe during ingestion.
#[cfg(feature = "native-engine")]
unsafe impl Send for EngineHandle {}
#[cfg(feature = "native-engine")]
unsafe impl Sync for EngineHandle {}

/// Native backend implementation of [`CartoFacade`]. Only available
/// when built with the `native-engine` feature; see the module-level
/// note on [`NATIVE_LIB_REFCOUNT`].
#[cfg(feature = "native-engine")]
pub struct NativeCartoFacade {
    handle: EngineHandle,
}

#[cfg(feature = "native-engine")]
impl NativeCartoFacade {
    /// Starts the engine for `cfg` in `mode`, optionally seeded from a
    /// prior internal-state blob. Acquires the process-scoped library
    /// reference.
    pub fn start(
        cfg: &ResolvedConfig,
        mode: OperatingMode,
        prior_state: Option<&[u8]>,
    ) -> Result<Self, CoreError> {
        acquire_native_library()?;
        match Self::start_inner(cfg, mode, prior_state) {
            Ok(facade) => Ok(facade),
            Err(err) => {
                release_native_library();
                Err(err)
            }
        }
    }

    fn start_inner(
        _cfg: &ResolvedConfig,
        _mode: OperatingMode,
        _prior_state: Option<&[u8]>,
    ) -> Result<Self, CoreError> {
        // The real binding would marshal `cfg`/`mode`/`prior_state`
        // across the FFI boundary here and receive a handle back.
        // Left as a stub: the native engine's ABI is out of this
        // crate's scope (spec §1).
        Ok(Self {
            handle: EngineHandle(std::ptr::null_mut::<c_void>()),
        })
    }
}

#[cfg(feature = "native-engine")]
impl CartoFacade for NativeCartoFacade {
    fn add_lidar(
        &self,
        _name: &str,
        _pcd: &[u8],
        _time: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<(), CoreError> {
        call_with_deadline(deadline, || Ok(()))
    }

    fn add_imu(
        &self,
        _name: &str,
        _linear_acceleration: Vector3,
        _angular_velocity: Vector3,
        _time: DateTime<Utc>,
        deadline: Duration,
    ) -> Result<(), CoreError> {
        call_with_deadline(deadline, || Ok(()))
    }

    fn position(&self) -> Result<PositionResponse, CoreError> {
        Err(CoreError::Native("position not ready".into()))
    }

    fn point_cloud_map(&self) -> Result<Vec<u8>, CoreError> {
        Err(CoreError::Native("map not ready".into()))
    }

    fn internal_state(&self) -> Result<Vec<u8>, CoreError> {
        Err(CoreError::Native("internal state not ready".into()))
    }

    fn latest_map_info(&self) -> Result<DateTime<Utc>, CoreError> {
        Err(CoreError::Native("map info not ready".into()))
    }

    fn run_optimization(&self) -> Result<(), CoreError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(feature = "native-engine")]
impl Drop for NativeCartoFacade {
    fn drop(&mut self) {
        release_native_library();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_timeout_is_distinguishable_from_other_errors() {
        let result: Result<(), CoreError> = call_with_deadline(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        });
        assert!(matches!(result, Err(CoreError::Deadline(_))));
    }

    #[test]
    fn fast_call_completes_within_deadline() {
        let result = call_with_deadline(Duration::from_millis(200), || Ok(42));
        assert_eq!(result.unwrap(), 42);
    }
}
