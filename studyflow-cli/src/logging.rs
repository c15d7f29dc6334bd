use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::LoggingSection;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init(section: &LoggingSection) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&section.level)
            .with_context(|| format!("parse log level '{}'", section.level))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if section.json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    installed.context("install tracing subscriber")?;
    Ok(())
}
