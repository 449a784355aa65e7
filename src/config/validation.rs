//! Configuration validation engine.
//!
//! ## Responsibility
//! Check the range and cross-field rules of a parsed [`EngineConfig`] that
//! serde cannot express.
//!
//! ## Guarantees
//! - Every rule has at least one test that triggers it
//! - All violations are collected before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)

use super::EngineConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "evolution.population_size").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate every semantic rule of `config`.
///
/// # Returns
///
/// - `Ok(())` if all rules pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &EngineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let evo = &config.evolution;

    // ── Evolution ranges ─────────────────────────────────────────────
    if !(1..=1000).contains(&evo.max_generations) {
        errors.push(invalid(
            "evolution.max_generations",
            evo.max_generations,
            "must be between 1 and 1000",
        ));
    }
    if !(1..=100).contains(&evo.population_size) {
        errors.push(invalid(
            "evolution.population_size",
            evo.population_size,
            "must be between 1 and 100",
        ));
    }
    if !(1..=32).contains(&evo.max_concurrent_evolutions) {
        errors.push(invalid(
            "evolution.max_concurrent_evolutions",
            evo.max_concurrent_evolutions,
            "must be between 1 and 32",
        ));
    }
    if !(1..=10).contains(&evo.num_evals) {
        errors.push(invalid(
            "evolution.num_evals",
            evo.num_evals,
            "must be between 1 and 10",
        ));
    }
    if !(0.0..=1.0).contains(&evo.eval_noise) {
        errors.push(invalid(
            "evolution.eval_noise",
            evo.eval_noise,
            "must be between 0.0 and 1.0",
        ));
    }
    if evo.tournament_size == 0 {
        errors.push(invalid(
            "evolution.tournament_size",
            0,
            "must be at least 1",
        ));
    }
    if evo.task_timeout_secs == 0 {
        errors.push(invalid(
            "evolution.task_timeout_secs",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Process limits ───────────────────────────────────────────────
    let proc = &config.process;
    if proc.sandbox.timeout_secs == 0 {
        errors.push(invalid(
            "process.sandbox.timeout_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if proc.sandbox.memory_limit_mb == 0 {
        errors.push(invalid(
            "process.sandbox.memory_limit_mb",
            0,
            "must be at least 1 MB",
        ));
    }
    if proc.sandbox.cpu_limit.is_nan() || proc.sandbox.cpu_limit <= 0.0 {
        errors.push(invalid(
            "process.sandbox.cpu_limit",
            proc.sandbox.cpu_limit,
            "must be greater than 0",
        ));
    }
    if !(0.0..=1.0).contains(&proc.constraints.min_test_coverage) {
        errors.push(invalid(
            "process.constraints.min_test_coverage",
            proc.constraints.min_test_coverage,
            "must be between 0.0 and 1.0",
        ));
    }
    if proc.status_poll_interval_ms == 0 {
        errors.push(invalid(
            "process.status_poll_interval_ms",
            0,
            "must be at least 1ms",
        ));
    }
    if proc.evolution_timeout_secs == 0 {
        errors.push(invalid(
            "process.evolution_timeout_secs",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Auto-approval ────────────────────────────────────────────────
    let auto = &proc.auto_approve;
    if !(0.0..=1.0).contains(&auto.max_risk_level) {
        errors.push(invalid(
            "process.auto_approve.max_risk_level",
            auto.max_risk_level,
            "must be a fraction between 0.0 and 1.0",
        ));
    }
    if auto.enabled && auto.types.is_empty() {
        errors.push(invalid(
            "process.auto_approve.types",
            "[]",
            "must list at least one type when auto-approval is enabled",
        ));
    }

    // ── Persistence ──────────────────────────────────────────────────
    let persist = &config.persistence;
    if persist.ttl_secs == 0 {
        errors.push(invalid("persistence.ttl_secs", 0, "must be at least 1 second"));
    }
    if persist.key_prefix.trim().is_empty() {
        errors.push(invalid(
            "persistence.key_prefix",
            "",
            "key prefix must not be empty",
        ));
    }
    if let Some(url) = &persist.redis_url {
        if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
            errors.push(invalid(
                "persistence.redis_url",
                url,
                "must start with redis:// or rediss://",
            ));
        }
    }

    // ── Health thresholds ────────────────────────────────────────────
    let health = &config.health;
    if !(0.0..=1.0).contains(&health.min_diversity) {
        errors.push(invalid(
            "health.min_diversity",
            health.min_diversity,
            "must be between 0.0 and 1.0",
        ));
    }
    if health.max_failure_ratio.is_nan() || health.max_failure_ratio < 0.0 {
        errors.push(invalid(
            "health.max_failure_ratio",
            health.max_failure_ratio,
            "must be non-negative",
        ));
    }
    if health.improvement_window < 2 {
        errors.push(invalid(
            "health.improvement_window",
            health.improvement_window,
            "slope needs at least 2 generations",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
