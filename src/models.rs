//! Data models for the pipeline.
//!
//! This module contains the core data structures shared by the stages,
//! the orchestrator, the run store and the aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The kind of artifact a stage produces; one per pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Synthetic scenario description.
    Scenario,
    /// Governance trace synthesized from a scenario.
    Governance,
    /// Judge verdict over scenario + governance.
    Evaluation,
}

impl ArtifactKind {
    /// All kinds in pipeline order.
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Scenario,
        ArtifactKind::Governance,
        ArtifactKind::Evaluation,
    ];

    /// File name of this artifact inside a run directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::Scenario => "scenario.json",
            ArtifactKind::Governance => "governance.json",
            ArtifactKind::Evaluation => "evaluation.json",
        }
    }

    /// Artifacts that must exist before this one may be produced.
    pub fn prerequisites(&self) -> &'static [ArtifactKind] {
        match self {
            ArtifactKind::Scenario => &[],
            ArtifactKind::Governance => &[ArtifactKind::Scenario],
            ArtifactKind::Evaluation => &[ArtifactKind::Scenario, ArtifactKind::Governance],
        }
    }

    /// Prompt variable under which this artifact is exposed to later stages.
    pub fn prompt_variable(&self) -> &'static str {
        match self {
            ArtifactKind::Scenario => "scenario_json",
            ArtifactKind::Governance => "governance_json",
            ArtifactKind::Evaluation => "evaluation_json",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Scenario => "scenario",
            ArtifactKind::Governance => "governance",
            ArtifactKind::Evaluation => "evaluation",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a single run/stage pair.
///
/// Built by the caller before a batch starts and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub run_id: String,
    pub class_tag: String,
    pub stage: ArtifactKind,
    /// Variables substituted into the stage's prompt template.
    pub prompt_inputs: BTreeMap<String, String>,
}

impl WorkItem {
    /// Create a work item with the standard `run_id` / `scenario_class` inputs.
    pub fn new(run_id: impl Into<String>, class_tag: impl Into<String>, stage: ArtifactKind) -> Self {
        let run_id = run_id.into();
        let class_tag = class_tag.into();
        let mut prompt_inputs = BTreeMap::new();
        prompt_inputs.insert("run_id".to_string(), run_id.clone());
        prompt_inputs.insert("scenario_class".to_string(), class_tag.clone());
        Self {
            run_id,
            class_tag,
            stage,
            prompt_inputs,
        }
    }
}

/// Terminal status of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    /// Artifact already present and overwrite was not requested.
    Skipped,
    TransientFailure,
    PermanentFailure,
    ValidationFailure,
    StorageFailure,
}

impl InvocationStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, InvocationStatus::Success | InvocationStatus::Skipped)
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvocationStatus::Success => "success",
            InvocationStatus::Skipped => "skipped",
            InvocationStatus::TransientFailure => "transient failure",
            InvocationStatus::PermanentFailure => "permanent failure",
            InvocationStatus::ValidationFailure => "validation failure",
            InvocationStatus::StorageFailure => "storage failure",
        };
        f.write_str(s)
    }
}

/// Outcome of one work item within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub run_id: String,
    pub class_tag: String,
    pub stage: ArtifactKind,
    pub status: InvocationStatus,
    /// Persisted payload (present on success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Error message (present on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock time spent on the item, including retries.
    pub elapsed_ms: u64,
}

/// Per-status counts for a finished batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub transient: usize,
    pub permanent: usize,
    pub validation: usize,
    pub storage: usize,
    /// Run ids to re-submit, sorted.
    pub failed_runs: Vec<String>,
}

impl BatchStats {
    /// Creates stats from a list of results.
    pub fn from_results(results: &[InvocationResult]) -> Self {
        let mut stats = Self {
            total: results.len(),
            ..Self::default()
        };

        for result in results {
            match result.status {
                InvocationStatus::Success => stats.success += 1,
                InvocationStatus::Skipped => stats.skipped += 1,
                InvocationStatus::TransientFailure => stats.transient += 1,
                InvocationStatus::PermanentFailure => stats.permanent += 1,
                InvocationStatus::ValidationFailure => stats.validation += 1,
                InvocationStatus::StorageFailure => stats.storage += 1,
            }
            if result.status.is_failure() {
                stats.failed_runs.push(result.run_id.clone());
            }
        }

        stats.failed_runs.sort_by(|a, b| compare_run_ids(a, b));
        stats
    }

    pub fn failures(&self) -> usize {
        self.transient + self.permanent + self.validation + self.storage
    }
}

/// Order run ids numerically when both are numbers, lexically otherwise.
pub fn compare_run_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Severity level of a governance violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Low severity - minor policy deviation
    Low,
    /// Medium severity - policy breach with limited impact
    Medium,
    /// High severity - significant breach
    High,
    /// Critical severity - safety or security critical breach
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

impl Severity {
    /// All severities, lowest first.
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    /// Returns an emoji representation of the severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Low => "🟢",
            Severity::Medium => "🟡",
            Severity::High => "🟠",
            Severity::Critical => "🔴",
        }
    }

    /// Parse a severity case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Judge scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub compliance_score: f64,
    pub risk_identification_recall: f64,
    pub mitigation_quality: f64,
    pub coherence: f64,
    pub grounding: f64,
    pub action_validity: f64,
}

impl Metrics {
    /// Metric keys in schema order.
    pub const NAMES: [&'static str; 6] = [
        "compliance_score",
        "risk_identification_recall",
        "mitigation_quality",
        "coherence",
        "grounding",
        "action_validity",
    ];

    /// `(name, value)` pairs in schema order.
    pub fn values(&self) -> [(&'static str, f64); 6] {
        [
            ("compliance_score", self.compliance_score),
            ("risk_identification_recall", self.risk_identification_recall),
            ("mitigation_quality", self.mitigation_quality),
            ("coherence", self.coherence),
            ("grounding", self.grounding),
            ("action_validity", self.action_validity),
        ]
    }
}

/// A policy violation found by the judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub policy: String,
    pub severity: Severity,
    pub evidence: String,
}

/// Operational measurements attached to an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Operational {
    pub latency_ms: f64,
    pub token_cost_estimate: f64,
}

/// Typed form of `evaluation.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub run_id: String,
    pub model: String,
    /// Scenario class, stamped by the pipeline after validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_tag: Option<String>,
    pub metrics: Metrics,
    pub violations: Vec<Violation>,
    pub emergent_risk_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational: Option<Operational>,
    pub judge_notes: String,
}

/// Sidecar written when a run directory is allocated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub class_tag: String,
    pub created_at: DateTime<Utc>,
}

/// On-disk state of one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub class_tag: Option<String>,
    pub scenario: Option<serde_json::Value>,
    pub governance: Option<serde_json::Value>,
    pub evaluation: Option<serde_json::Value>,
}

impl RunRecord {
    /// Returns the stored artifact of the given kind.
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&serde_json::Value> {
        match kind {
            ArtifactKind::Scenario => self.scenario.as_ref(),
            ArtifactKind::Governance => self.governance.as_ref(),
            ArtifactKind::Evaluation => self.evaluation.as_ref(),
        }
    }
}

/// Corpus-level statistics, recomputed in full from the evaluation artifacts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusSummary {
    pub total_runs: usize,
    pub by_class: BTreeMap<String, usize>,
    pub macro_avgs: BTreeMap<String, f64>,
    pub emergent_risk_counts: BTreeMap<String, usize>,
    /// Population standard deviation per metric.
    #[serde(default)]
    pub std_devs: BTreeMap<String, f64>,
    /// Macro averages computed within each class.
    #[serde(default)]
    pub class_macro_avgs: BTreeMap<String, BTreeMap<String, f64>>,
    /// Number of violation entries per severity.
    #[serde(default)]
    pub severity_counts: BTreeMap<String, usize>,
    /// Runs whose evaluation artifact failed validation.
    #[serde(default)]
    pub excluded_runs: Vec<String>,
    /// Runs holding each artifact kind, evaluated or not.
    #[serde(default)]
    pub stage_counts: BTreeMap<String, usize>,
    /// Scenario attribute -> value -> number of evaluated runs.
    #[serde(default)]
    pub scenario_breakdown: BTreeMap<String, BTreeMap<String, usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}
