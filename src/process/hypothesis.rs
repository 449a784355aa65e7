//! Improvement hypotheses driven through an [`EvolutionProcess`](super::EvolutionProcess).

use serde::{Deserialize, Serialize};

/// Expected effect of a hypothesis on one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedImpact {
    /// Metric name, e.g. `"latency_ms"`.
    pub metric: String,
    /// Value before the change.
    pub current_value: f64,
    /// Expected relative improvement, in percent.
    pub improvement_percentage: f64,
}

/// A proposed, not yet applied, code improvement.
///
/// # Example
///
/// ```rust
/// use tokio_evolution_orchestrator::process::ImprovementHypothesis;
///
/// let h = ImprovementHypothesis::new("h-1", "performance", "cache parsed ASTs")
///     .with_confidence(0.9)
///     .with_impact("latency_ms", 120.0, 25.0)
///     .with_dependencies(["src/parser.rs"]);
/// assert!(h.risks.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementHypothesis {
    /// Hypothesis id.
    pub id: String,
    /// Category, matched against the auto-approve type list.
    #[serde(rename = "type")]
    pub hypothesis_type: String,
    /// What the change does.
    pub description: String,
    /// Proposer's confidence, in `[0, 1]`.
    pub confidence: f64,
    /// Known risks; each one lowers the safety score.
    #[serde(default)]
    pub risks: Vec<String>,
    /// Expected metric changes.
    #[serde(default)]
    pub expected_impact: Vec<ExpectedImpact>,
    /// Files the change touches.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ImprovementHypothesis {
    /// Hypothesis with confidence 0.5 and no risks, impacts or dependencies.
    pub fn new(
        id: impl Into<String>,
        hypothesis_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            hypothesis_type: hypothesis_type.into(),
            description: description.into(),
            confidence: 0.5,
            risks: Vec::new(),
            expected_impact: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Set the confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Add a risk.
    pub fn with_risk(mut self, risk: impl Into<String>) -> Self {
        self.risks.push(risk.into());
        self
    }

    /// Add an expected impact.
    pub fn with_impact(
        mut self,
        metric: impl Into<String>,
        current_value: f64,
        improvement_percentage: f64,
    ) -> Self {
        self.expected_impact.push(ExpectedImpact {
            metric: metric.into(),
            current_value,
            improvement_percentage,
        });
        self
    }

    /// Replace the dependency list.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates() {
        let h = ImprovementHypothesis::new("h", "refactor", "split module")
            .with_confidence(0.8)
            .with_risk("touches public api")
            .with_risk("no tests")
            .with_impact("loc", 900.0, 10.0);
        assert_eq!(h.risks.len(), 2);
        assert_eq!(h.expected_impact[0].metric, "loc");
        assert_eq!(h.confidence, 0.8);
    }

    #[test]
    fn test_type_field_name_on_wire() {
        let h = ImprovementHypothesis::new("h", "performance", "d");
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["type"], "performance");
        let back: ImprovementHypothesis = serde_json::from_value(serde_json::json!({
            "id": "x", "type": "bugfix", "description": "d", "confidence": 0.4
        }))
        .unwrap();
        assert_eq!(back.hypothesis_type, "bugfix");
        assert!(back.dependencies.is_empty());
    }
}
