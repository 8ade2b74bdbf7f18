use anyhow::Context;
use tracing::{dispatcher, Dispatch};
use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, EnvFilter, Registry};

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod metrics;
pub mod replay;
pub mod sensor;
pub mod service;
pub mod storage;

#[doc(hidden)]
pub mod testutil;

pub use config::{Defaults, OperatingMode, RawSettings, ResolvedConfig};
pub use engine::CartoFacade;
#[cfg(feature = "native-engine")]
pub use engine::NativeCartoFacade;
pub use error::CoreError;
pub use sensor::{ImuBinding, LidarBinding, SensorContext};
pub use service::{SensorBindings, Service};

/// Installs the process-wide structured logging subscriber. `RUST_LOG`
/// is honored by the default filter; falls back to `info`.
pub fn setup_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let subscriber = Registry::default()
        .with(filter)
        .with(tracing_logfmt::layer());
    dispatcher::set_global_default(Dispatch::new(subscriber))
        .context("global logger has already been set")?;
    Ok(())
}
