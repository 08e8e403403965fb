// Logging setup for the CLI. The library only emits `tracing` events.

use anyhow::{anyhow, Result};
use tracing::Level;

/// Parse a level name; unknown names are an error rather than silently ignored
pub fn parse_level(level: &str) -> Result<Level> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| anyhow!("Unknown log level '{}' (expected trace, debug, info, warn or error)", level))
}

/// Install a stderr fmt subscriber. `debug` overrides the configured level.
///
/// Calling this twice is harmless: the second install is refused and ignored.
pub fn init_logging(level: &str, debug: bool) -> Result<()> {
    let level = if debug { Level::DEBUG } else { parse_level(level)? };

    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(level = %level, "logging_initialized");
    }
    Ok(())
}
