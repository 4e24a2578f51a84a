//! Process-wide log output.
//!
//! The SDK logs through `tracing`. Plugins may install their own subscriber; the one
//! installed by [`init`] additionally lets the platform switch debug output on and off
//! through the driver start configuration.

use std::sync::OnceLock;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, Registry};

use crate::error::{Error, ErrorKind, Result};

static LEVEL_HANDLE: OnceLock<reload::Handle<LevelFilter, Registry>> = OnceLock::new();

/// Installs the SDK's subscriber as the global default.
pub fn init(debug: bool) -> Result<()> {
    let (filter, handle) = reload::Layer::new(level(debug));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| {
            Error::DefaultError(ErrorKind::ConfigError(format!(
                "installing log subscriber: {e}"
            )))
        })?;
    let _ = LEVEL_HANDLE.set(handle);
    Ok(())
}

/// Switches between DEBUG and INFO output. Does nothing unless [`init`] installed the
/// subscriber.
pub fn set_debug(debug: bool) {
    let Some(handle) = LEVEL_HANDLE.get() else {
        return;
    };
    if let Err(e) = handle.modify(|filter| *filter = level(debug)) {
        tracing::warn!(?e, "failed to change log level");
    }
}

fn level(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level() {
        assert_eq!(level(true), LevelFilter::DEBUG);
        assert_eq!(level(false), LevelFilter::INFO);
    }

    #[test]
    fn test_set_debug_without_init_is_noop() {
        set_debug(true);
        set_debug(false);
    }
}
