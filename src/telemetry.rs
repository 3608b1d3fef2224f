//! Logging setup and operator banners.
//!
//! One `fmt` layer per configured output (`stderr`, `stdout` or a file
//! path), all behind a single `EnvFilter`. `RUST_LOG` wins over the
//! configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::{Error, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(level: &str, outputs: &[String]) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::validation(format!("invalid log level {level:?}: {e}")))?;

    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(outputs.len());
    for output in outputs {
        let layer: BoxedLayer = match output.as_str() {
            "stderr" => fmt::layer().with_writer(std::io::stderr).boxed(),
            "stdout" => fmt::layer().with_writer(std::io::stdout).boxed(),
            path => {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .boxed()
            }
        };
        layers.push(layer);
    }
    if layers.is_empty() {
        layers.push(fmt::layer().with_writer(std::io::stderr).boxed());
    }

    // try_init fails only when a subscriber is already installed
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();
    Ok(())
}

/// Print an operator-facing banner to stderr.
pub fn banner(title: &str) {
    eprintln!("\n\n\n============================================================");
    eprintln!("=== {title} ===");
    eprintln!("============================================================\n");
}

/// Banner printed when Up fails, with the command that cleans up.
pub fn failure_banner(phase: &str, error: &str, config_path: &str) {
    banner(&format!("{phase} FAILED"));
    eprintln!("error: {error}\n");
    eprintln!("to delete everything that was created, run:\n");
    eprintln!("    eks-harness delete cluster --path {config_path}\n");
}
