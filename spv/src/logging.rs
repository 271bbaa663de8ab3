//! Logging setup for the SPV client

use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `log_level` when set.
pub fn init_logging(log_level: Option<Level>) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = log_level.unwrap_or(Level::INFO);
        EnvFilter::new(format!("spv={},supernova_spv={}", level, level))
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| format!("Failed to set global default subscriber: {}", e))?;

    info!("Logging initialized");
    Ok(())
}
