//! Prometheus metrics for the evolution engine.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The recording helpers
//! (`record_phase_latency`, `record_selection`, …) are no-ops on the
//! Prometheus side if `init_metrics` was never called; each helper also emits
//! a `tracing` event so the numbers are visible in logs either way.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `evolution_phase_duration_seconds` | Histogram | `phase` |
//! | `evolution_selections_total` | Counter | `method` |
//! | `evolution_generations_total` | Counter | — |
//! | `evolution_agents_finished_total` | Counter | `status` |
//! | `evolution_mean_fitness` | Gauge | — |
//! | `evolution_process_outcomes_total` | Counter | `state` |
//! | `evolution_rollbacks_total` | Counter | `result` |

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    core::Collector, Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

use crate::OrchestratorError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the engine, stored together in one [`OnceLock`].
pub struct Metrics {
    /// Registry owning every descriptor below.
    pub registry: Registry,
    /// Per-phase latency of evolution processes.
    pub phase_duration: HistogramVec,
    /// Parents selected, by method.
    pub selections_total: CounterVec,
    /// Generations transitioned.
    pub generations_total: Counter,
    /// Agents reaching a terminal status at a generation boundary.
    pub agents_finished: CounterVec,
    /// Mean accuracy of the most recently closed generation.
    pub mean_fitness: Gauge,
    /// Terminal evolution-process states.
    pub process_outcomes: CounterVec,
    /// Rollback attempts by result.
    pub rollbacks_total: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, prometheus::Error>
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl Metrics {
    /// Build a bundle whose metric names start with `prefix`.
    fn build(prefix: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let name = |suffix: &str| format!("{prefix}_{suffix}");

        let phase_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    name("phase_duration_seconds"),
                    "Evolution process phase duration",
                ),
                &["phase"],
            )?,
        )?;
        let selections_total = register(
            &registry,
            CounterVec::new(
                Opts::new(name("selections_total"), "Parents selected by method"),
                &["method"],
            )?,
        )?;
        let generations_total = register(
            &registry,
            Counter::new(name("generations_total"), "Generations transitioned")?,
        )?;
        let agents_finished = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    name("agents_finished_total"),
                    "Agents closed at a generation boundary",
                ),
                &["status"],
            )?,
        )?;
        let mean_fitness = register(
            &registry,
            Gauge::new(name("mean_fitness"), "Mean accuracy of the last generation")?,
        )?;
        let process_outcomes = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    name("process_outcomes_total"),
                    "Terminal evolution process states",
                ),
                &["state"],
            )?,
        )?;
        let rollbacks_total = register(
            &registry,
            CounterVec::new(
                Opts::new(name("rollbacks_total"), "Rollback attempts by result"),
                &["result"],
            )?,
        )?;

        Ok(Self {
            registry,
            phase_duration,
            selections_total,
            generations_total,
            agents_finished,
            mean_fitness,
            process_outcomes,
            rollbacks_total,
        })
    }
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics in a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = Metrics::build("evolution")
        .map_err(|e| OrchestratorError::Other(format!("metrics init failed: {e}")))?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Recording helpers ──────────────────────────────────────────────────────

/// Record how long one evolution-process phase took.
pub fn record_phase_latency(phase: &str, d: Duration) {
    tracing::debug!(
        metric = "phase_latency_ms",
        phase = phase,
        latency_ms = d.as_millis() as u64,
        "phase finished"
    );
    if let Some(m) = metrics() {
        if let Ok(h) = m.phase_duration.get_metric_with_label_values(&[phase]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Record `n` parents chosen with `method`.
pub fn record_selection(method: &str, n: usize) {
    tracing::debug!(metric = "selections", method = method, count = n, "parents selected");
    if let Some(m) = metrics() {
        if let Ok(c) = m.selections_total.get_metric_with_label_values(&[method]) {
            c.inc_by(n as f64);
        }
    }
}

/// Record a generation boundary.
///
/// # Panics
///
/// This function never panics.
pub fn record_generation_complete(
    generation: u32,
    evaluated: usize,
    failed: usize,
    mean_fitness: f64,
) {
    tracing::info!(
        metric = "generation_complete",
        generation = generation,
        evaluated = evaluated,
        failed = failed,
        mean_fitness = mean_fitness,
        "generation closed"
    );
    if let Some(m) = metrics() {
        m.generations_total.inc();
        m.mean_fitness.set(mean_fitness);
        if let Ok(c) = m.agents_finished.get_metric_with_label_values(&["evaluated"]) {
            c.inc_by(evaluated as f64);
        }
        if let Ok(c) = m.agents_finished.get_metric_with_label_values(&["failed"]) {
            c.inc_by(failed as f64);
        }
    }
}

/// Record the terminal state of an evolution process.
pub fn record_process_outcome(state: &str) {
    tracing::debug!(metric = "process_outcome", state = state, "process finished");
    if let Some(m) = metrics() {
        if let Ok(c) = m.process_outcomes.get_metric_with_label_values(&[state]) {
            c.inc();
        }
    }
}

/// Record a rollback attempt.
pub fn record_rollback(evolution_id: &str, ok: bool) {
    if ok {
        tracing::info!(metric = "rollback", evolution_id = evolution_id, "rollback succeeded");
    } else {
        tracing::warn!(metric = "rollback", evolution_id = evolution_id, "rollback failed");
    }
    if let Some(m) = metrics() {
        let result = if ok { "ok" } else { "error" };
        if let Ok(c) = m.rollbacks_total.get_metric_with_label_values(&[result]) {
            c.inc();
        }
    }
}

// ── Export ─────────────────────────────────────────────────────────────────

/// Encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or encoding fails.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Snapshot of the counters operators look at most.
#[derive(Debug, Default)]
pub struct MetricsSummary {
    /// Generations transitioned.
    pub generations: u64,
    /// Terminal process states keyed by state label.
    pub process_outcomes: HashMap<String, u64>,
    /// Selections keyed by method label.
    pub selections: HashMap<String, u64>,
}

fn counter_by_label(vec: &CounterVec, label: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == label)
                .map_or("unknown", |l| l.get_value());
            out.insert(key.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    out
}

/// Return current counter values, zeroed if metrics are not initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    let Some(m) = metrics() else {
        return MetricsSummary::default();
    };
    MetricsSummary {
        generations: m.generations_total.get() as u64,
        process_outcomes: counter_by_label(&m.process_outcomes, "state"),
        selections: counter_by_label(&m.selections_total, "method"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_isolated_bundle_counts_selections_by_method() {
        let m = Metrics::build("t_sel").unwrap();
        m.selections_total
            .get_metric_with_label_values(&["tournament"])
            .unwrap()
            .inc_by(3.0);
        let counts = counter_by_label(&m.selections_total, "method");
        assert_eq!(counts.get("tournament"), Some(&3));
    }

    #[test]
    fn test_isolated_bundle_records_phase_histogram() {
        let m = Metrics::build("t_phase").unwrap();
        m.phase_duration
            .get_metric_with_label_values(&["testing"])
            .unwrap()
            .observe(0.25);
        let families = m.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "t_phase_phase_duration_seconds")
            .unwrap();
        assert_eq!(family.get_metric()[0].get_histogram().get_sample_count(), 1);
    }

    #[test]
    fn test_recording_helpers_never_panic() {
        record_phase_latency("generating", Duration::from_millis(3));
        record_selection("score_prop", 4);
        record_generation_complete(1, 3, 1, 0.5);
        record_process_outcome("completed");
        record_rollback("evo-1", false);
        let _ = get_metrics_summary();
    }

    #[test]
    fn test_gather_metrics_after_observation_mentions_family() {
        let _ = init_metrics();
        record_process_outcome("rejected");
        let text = gather_metrics();
        assert!(text.contains("evolution_process_outcomes_total"));
    }
}
