//! # Engine configuration
//!
//! ## Responsibility
//! Describe every tunable of the engine as one TOML document: evolution
//! sizing and selection, process limits and approval policy, persistence
//! and health thresholds.
//!
//! ## Guarantees
//! - Total defaults: an empty document deserializes to a valid config
//! - Validated: `loader` never returns a config that fails `validation`
//! - Schema-exportable: [`json_schema`] documents the format for editors
//!
//! ## NOT Responsible For
//! - Watching files for changes
//! - Building engine components (each component has a `From<&EngineConfig>`)

pub mod loader;
pub mod validation;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::population::HealthThresholds;
use crate::process::{
    AutoApprovePolicy, CollaboratorError, ConfigManager, EvolutionConstraints, ProcessPolicy,
    SandboxLimits,
};
use crate::selection::SelectionMethod;

pub use loader::{load_from_file, load_from_str};
pub use validation::{validate, ConfigError};

// ── Default value functions ──────────────────────────────────────────────

fn default_max_generations() -> u32 {
    10
}

fn default_population_size() -> usize {
    4
}

fn default_selection_method() -> SelectionMethod {
    SelectionMethod::ScoreChildProp
}

fn default_max_concurrent_evolutions() -> usize {
    2
}

fn default_num_evals() -> u32 {
    1
}

fn default_eval_noise() -> f64 {
    0.1
}

fn default_tournament_size() -> usize {
    crate::selection::DEFAULT_TOURNAMENT_SIZE
}

/// One hour per self-improvement task.
fn default_task_timeout_secs() -> u64 {
    3600
}

fn default_status_poll_interval_ms() -> u64 {
    500
}

fn default_evolution_timeout_secs() -> u64 {
    600
}

/// 24 hours.
fn default_ttl_secs() -> u64 {
    86_400
}

fn default_key_prefix() -> String {
    "evolution".to_string()
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration.
///
/// # Example
///
/// ```toml
/// [evolution]
/// max_generations = 20
/// population_size = 8
/// selection_method = "tournament"
///
/// [process.auto_approve]
/// enabled = true
/// max_risk_level = 0.2
/// types = ["performance"]
///
/// [persistence]
/// redis_url = "redis://127.0.0.1:6379"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// Generation sizing and parent selection.
    #[serde(default)]
    pub evolution: EvolutionSection,
    /// Per-process limits and approval policy.
    #[serde(default)]
    pub process: ProcessSection,
    /// Resumability store.
    #[serde(default)]
    pub persistence: PersistenceSection,
    /// Population health thresholds.
    #[serde(default)]
    pub health: HealthThresholds,
}

/// `[evolution]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EvolutionSection {
    /// Generations to run, 1..=1000.
    #[serde(default = "default_max_generations")]
    pub max_generations: u32,
    /// Children per generation, 1..=100.
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Parent selection strategy.
    #[serde(default = "default_selection_method")]
    pub selection_method: SelectionMethod,
    /// Evolution processes allowed to run at once, 1..=32.
    #[serde(default = "default_max_concurrent_evolutions")]
    pub max_concurrent_evolutions: usize,
    /// Benchmark repetitions per candidate, 1..=10.
    #[serde(default = "default_num_evals")]
    pub num_evals: u32,
    /// Noise injected into evaluation, 0.0..=1.0.
    #[serde(default = "default_eval_noise")]
    pub eval_noise: f64,
    /// Candidates drawn per tournament.
    #[serde(default = "default_tournament_size")]
    pub tournament_size: usize,
    /// Seed for selection and entry generation; unset seeds from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Timeout handed to the execution backend with each task, and the
    /// longest a generation may wait for its tasks.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
}

impl Default for EvolutionSection {
    fn default() -> Self {
        Self {
            max_generations: default_max_generations(),
            population_size: default_population_size(),
            selection_method: default_selection_method(),
            max_concurrent_evolutions: default_max_concurrent_evolutions(),
            num_evals: default_num_evals(),
            eval_noise: default_eval_noise(),
            tournament_size: default_tournament_size(),
            seed: None,
            task_timeout_secs: default_task_timeout_secs(),
        }
    }
}

/// `[process]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProcessSection {
    /// Sandbox resource ceiling.
    #[serde(default)]
    pub sandbox: SandboxLimits,
    /// Constraints attached to every evolution request.
    #[serde(default)]
    pub constraints: EvolutionConstraints,
    /// Delay between bridge status polls.
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
    /// Longest wait for the bridge to finish generating.
    #[serde(default = "default_evolution_timeout_secs")]
    pub evolution_timeout_secs: u64,
    /// Automatic approval rule.
    #[serde(default)]
    pub auto_approve: AutoApprovePolicy,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            sandbox: SandboxLimits::default(),
            constraints: EvolutionConstraints::default(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            evolution_timeout_secs: default_evolution_timeout_secs(),
            auto_approve: AutoApprovePolicy::default(),
        }
    }
}

/// `[persistence]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PersistenceSection {
    /// Redis URL; unset keeps generation data in memory only.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Expiry of persisted generation data.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Prefix for every store key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_secs: default_ttl_secs(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// JSON Schema of [`EngineConfig`], pretty-printed.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn json_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EngineConfig);
    serde_json::to_string_pretty(&schema)
}

// ── Policy adapter ───────────────────────────────────────────────────────

/// [`ConfigManager`] serving the `[process.auto_approve]` section of a
/// fixed config.
#[derive(Debug, Clone)]
pub struct StaticConfigManager {
    policy: AutoApprovePolicy,
}

impl StaticConfigManager {
    /// Adapter over `config`.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            policy: config.process.auto_approve.clone(),
        }
    }
}

#[async_trait]
impl ConfigManager for StaticConfigManager {
    async fn get_config(&self) -> Result<ProcessPolicy, CollaboratorError> {
        Ok(ProcessPolicy {
            auto_approve: Some(self.policy.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.evolution.population_size, 4);
        assert_eq!(config.persistence.ttl_secs, 86_400);
        assert_eq!(config.health.stagnation_generations, 3);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
[evolution]
selection_method = "tournament"
seed = 7
"#,
        )
        .unwrap();
        assert_eq!(config.evolution.selection_method, SelectionMethod::Tournament);
        assert_eq!(config.evolution.seed, Some(7));
        assert_eq!(config.evolution.max_generations, 10);
    }

    #[test]
    fn test_unknown_selection_method_fails_to_parse() {
        let res: Result<EngineConfig, _> = toml::from_str(
            r#"
[evolution]
selection_method = "elitist"
"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_json_schema_names_sections() {
        let schema = json_schema().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&schema).unwrap();
        let props = parsed.get("properties").unwrap();
        for section in ["evolution", "process", "persistence", "health"] {
            assert!(props.get(section).is_some(), "missing {section}");
        }
    }

    #[tokio::test]
    async fn test_static_config_manager_serves_auto_approve() {
        let mut config = EngineConfig::default();
        config.process.auto_approve.enabled = true;
        config.process.auto_approve.types = vec!["performance".into()];
        let policy = StaticConfigManager::new(&config).get_config().await.unwrap();
        let auto = policy.auto_approve.unwrap();
        assert!(auto.enabled);
        assert_eq!(auto.types, vec!["performance".to_string()]);
    }
}
