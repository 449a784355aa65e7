//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML document, parse it into an [`EngineConfig`] and validate it.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O, parse and validation failures are distinct error variants
//! - The source name is included in every parse and I/O error
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use tracing::debug;

use super::validation::{self, ConfigError};
use super::EngineConfig;

/// Load an [`EngineConfig`] from a TOML file.
///
/// # Errors
///
/// - [`ConfigError::Io`] if the file cannot be read.
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::Validation`] listing every violated rule.
///
/// # Example
///
/// ```rust,ignore
/// use tokio_evolution_orchestrator::config::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("evolution.toml"))?;
/// println!("population: {}", config.evolution.population_size);
/// ```
pub fn load_from_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load an [`EngineConfig`] from a TOML string.
///
/// `source_name` identifies the document in error messages.
///
/// # Errors
///
/// - [`ConfigError::Parse`] if the TOML is malformed.
/// - [`ConfigError::Validation`] listing every violated rule, one per line.
pub fn load_from_str(content: &str, source_name: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    debug!(source = source_name, "configuration loaded");
    Ok(config)
}
