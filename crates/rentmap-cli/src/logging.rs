/*!
Logging and optional profiling setup for the `rentmap` binary.

Logs go to stderr so stdout stays reserved for JSON output. The filter comes from
`RUST_LOG` and defaults to `info`.

Two implementations share one API:

- real: compiled with `feature = "profiling"`. Adds a `tracing-chrome` layer when a trace
  file is requested; the trace is flushed when the returned guard is dropped.
- stub: compiled otherwise. Logging only; a requested trace file is reported and ignored.
*/

use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(feature = "profiling")]
mod inner {
    use std::path::Path;
    use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    /// Keeps the Chrome trace open; dropping it flushes the file
    pub struct LoggingGuard {
        _flush: Option<FlushGuard>,
    }

    pub fn setup_logging(trace_file: Option<&Path>) -> LoggingGuard {
        let (chrome_layer, flush) = match trace_file {
            Some(path) => {
                let (layer, guard) = ChromeLayerBuilder::new().file(path).build();
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(super::env_filter());
        tracing_subscriber::registry()
            .with(chrome_layer)
            .with(fmt_layer)
            .init();

        if let Some(path) = trace_file {
            tracing::info!("Recording Chrome trace to {}", path.display());
        }
        LoggingGuard { _flush: flush }
    }
}

#[cfg(not(feature = "profiling"))]
mod inner {
    use std::path::Path;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    pub struct LoggingGuard;

    pub fn setup_logging(trace_file: Option<&Path>) -> LoggingGuard {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(super::env_filter());
        tracing_subscriber::registry().with(fmt_layer).init();

        if let Some(path) = trace_file {
            tracing::warn!(
                "Ignoring --trace-file {}: profiling is disabled in this build",
                path.display()
            );
        }
        LoggingGuard
    }
}

pub use inner::{LoggingGuard, setup_logging};
