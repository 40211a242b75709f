//! Start logging to console and, optionally, a file.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// default `info` level.
pub fn initiate_logging(
    path: Option<&Path>,
    disable_console: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let file_layer = match path {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let file_writer = std::sync::Mutex::new(file);
            Some(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(false),
            )
        }
        None => None,
    };

    let console_layer = if disable_console {
        None
    } else {
        Some(fmt::layer().with_target(false))
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter);
    tracing::subscriber::set_global_default(collector)?;

    if let Some(path) = path {
        tracing::debug!("logging to file \"{}\"", path.display());
    }
    Ok(())
}
