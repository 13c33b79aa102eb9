use crate::error::{GraphError, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Filter applied when neither an explicit level nor `RUST_LOG` is set.
const DEFAULT_FILTER: &str = "vesper=info";

/// Initializes the process-wide tracing subscriber.
///
/// An empty `level` defers to `RUST_LOG` and falls back to
/// [`DEFAULT_FILTER`]; anything else is parsed as an `EnvFilter` directive
/// (e.g. `"vesper::wal=debug,vesper=info"`).
pub fn init_logging(level: &str) -> Result<()> {
    let filter = if level.is_empty() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    } else {
        EnvFilter::try_new(level).map_err(|e| {
            GraphError::InvalidArgument(format!("invalid log filter {level:?}: {e}"))
        })?
    };
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|_| GraphError::InvalidArgument("logging already initialized".into()))
}
