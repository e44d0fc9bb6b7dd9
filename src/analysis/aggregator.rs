//! Corpus aggregation and statistics.
//!
//! This module turns the evaluation artifacts of every run into a single
//! [`CorpusSummary`].

use crate::models::{ArtifactKind, CorpusSummary, Evaluation, Metrics, RunRecord, Severity};
use crate::store::{RunStore, StoreError};
use crate::validate;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Class used when neither the evaluation nor the manifest names one.
pub const UNKNOWN_CLASS: &str = "unknown";

/// Scenario fields tallied into `scenario_breakdown`.
pub const SCENARIO_ATTRIBUTES: [&str; 6] = [
    "agent_type",
    "agent_architecture",
    "industry",
    "region",
    "attack_type",
    "safety_criticality",
];

/// A validated evaluation together with its resolved class.
#[derive(Debug, Clone)]
pub struct ClassifiedEvaluation {
    pub class_tag: String,
    pub evaluation: Evaluation,
    pub scenario: Option<Value>,
}

/// Aggregate every evaluated run under the store root.
pub fn aggregate(store: &RunStore) -> Result<CorpusSummary, StoreError> {
    let runs = store.read_all_runs()?;
    debug!(runs = runs.len(), root = %store.root().display(), "Aggregating runs");
    Ok(aggregate_runs(&runs))
}

/// Validate evaluations and resolve class tags.
///
/// Returns the usable evaluations and the ids of runs whose evaluation
/// artifact failed validation. Runs without an evaluation are neither.
pub fn classify_runs(runs: &[RunRecord]) -> (Vec<ClassifiedEvaluation>, Vec<String>) {
    let mut evaluated = Vec::new();
    let mut excluded = Vec::new();

    for run in runs {
        let Some(value) = &run.evaluation else {
            continue;
        };

        match validate::parse_evaluation(value) {
            Ok(evaluation) => {
                let class_tag = evaluation
                    .class_tag
                    .clone()
                    .or_else(|| run.class_tag.clone())
                    .unwrap_or_else(|| UNKNOWN_CLASS.to_string());
                evaluated.push(ClassifiedEvaluation {
                    class_tag,
                    evaluation,
                    scenario: run.scenario.clone(),
                });
            }
            Err(failure) => {
                warn!(run_id = %run.run_id, error = %failure, "Excluding run with invalid evaluation");
                excluded.push(run.run_id.clone());
            }
        }
    }

    (evaluated, excluded)
}

/// Aggregate already-loaded runs.
pub fn aggregate_runs(runs: &[RunRecord]) -> CorpusSummary {
    let (evaluated, excluded_runs) = classify_runs(runs);

    let metrics: Vec<&Metrics> = evaluated.iter().map(|e| &e.evaluation.metrics).collect();
    let (macro_avgs, std_devs) = metric_stats(&metrics);

    let mut class_macro_avgs = BTreeMap::new();
    for (class_tag, members) in group_by_class(&evaluated) {
        let class_metrics: Vec<&Metrics> = members.iter().map(|e| &e.evaluation.metrics).collect();
        let (avgs, _) = metric_stats(&class_metrics);
        class_macro_avgs.insert(class_tag, avgs);
    }

    CorpusSummary {
        total_runs: evaluated.len(),
        by_class: class_distribution(&evaluated),
        macro_avgs,
        emergent_risk_counts: emergent_risk_counts(&evaluated),
        std_devs,
        class_macro_avgs,
        severity_counts: severity_counts(&evaluated),
        excluded_runs,
        stage_counts: stage_counts(runs),
        scenario_breakdown: scenario_breakdown(&evaluated),
        generated_at: Some(Utc::now()),
    }
}

/// Count runs holding each artifact kind.
pub fn stage_counts(runs: &[RunRecord]) -> BTreeMap<String, usize> {
    ArtifactKind::ALL
        .iter()
        .map(|kind| {
            let count = runs.iter().filter(|run| run.artifact(*kind).is_some()).count();
            (kind.as_str().to_string(), count)
        })
        .collect()
}

/// Tally the tracked scenario attributes of evaluated runs.
///
/// Every tracked attribute gets an entry, empty when no scenario sets it.
/// Strings are trimmed; numbers and booleans use their JSON text; other
/// values are skipped.
pub fn scenario_breakdown(evaluated: &[ClassifiedEvaluation]) -> BTreeMap<String, BTreeMap<String, usize>> {
    let mut breakdown: BTreeMap<String, BTreeMap<String, usize>> = SCENARIO_ATTRIBUTES
        .iter()
        .map(|key| (key.to_string(), BTreeMap::new()))
        .collect();

    for e in evaluated {
        let Some(Value::Object(scenario)) = &e.scenario else {
            continue;
        };
        for key in SCENARIO_ATTRIBUTES {
            let label = match scenario.get(key) {
                Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
                _ => continue,
            };
            if let Some(counts) = breakdown.get_mut(key) {
                *counts.entry(label).or_default() += 1;
            }
        }
    }

    breakdown
}

/// Group evaluations by resolved class.
pub fn group_by_class(evaluated: &[ClassifiedEvaluation]) -> BTreeMap<String, Vec<&ClassifiedEvaluation>> {
    let mut grouped: BTreeMap<String, Vec<&ClassifiedEvaluation>> = BTreeMap::new();

    for e in evaluated {
        grouped.entry(e.class_tag.clone()).or_default().push(e);
    }

    grouped
}

/// Count runs per class.
pub fn class_distribution(evaluated: &[ClassifiedEvaluation]) -> BTreeMap<String, usize> {
    let mut dist = BTreeMap::new();

    for e in evaluated {
        *dist.entry(e.class_tag.clone()).or_default() += 1;
    }

    dist
}

/// Per-metric mean and population standard deviation, each run weighted equally.
pub fn metric_stats(metrics: &[&Metrics]) -> (BTreeMap<String, f64>, BTreeMap<String, f64>) {
    let mut means = BTreeMap::new();
    let mut std_devs = BTreeMap::new();

    if metrics.is_empty() {
        return (means, std_devs);
    }

    let n = metrics.len() as f64;
    for name in Metrics::NAMES {
        let values: Vec<f64> = metrics
            .iter()
            .flat_map(|m| m.values())
            .filter(|(metric, _)| *metric == name)
            .map(|(_, v)| v)
            .collect();

        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        means.insert(name.to_string(), mean);
        std_devs.insert(name.to_string(), variance.sqrt());
    }

    (means, std_devs)
}

/// Count emergent risk tags; a tag counts once per run however often it repeats.
pub fn emergent_risk_counts(evaluated: &[ClassifiedEvaluation]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();

    for e in evaluated {
        let unique: BTreeSet<&str> = e
            .evaluation
            .emergent_risk_tags
            .iter()
            .map(|t| t.trim())
            .collect();
        for tag in unique {
            *counts.entry(tag.to_string()).or_default() += 1;
        }
    }

    counts
}

/// Count violations by severity.
pub fn severity_counts(evaluated: &[ClassifiedEvaluation]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = Severity::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();

    for e in evaluated {
        for violation in &e.evaluation.violations {
            *counts.entry(violation.severity.as_str().to_string()).or_default() += 1;
        }
    }

    counts
}

/// The `n` most frequent risk tags, most frequent first.
pub fn top_risk_tags(summary: &CorpusSummary, n: usize) -> Vec<(&str, usize)> {
    let mut tags: Vec<(&str, usize)> = summary
        .emergent_risk_counts
        .iter()
        .map(|(tag, count)| (tag.as_str(), *count))
        .collect();

    tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    tags.truncate(n);
    tags
}

/// Generate a text summary of corpus statistics.
pub fn generate_summary_text(summary: &CorpusSummary) -> String {
    let mut lines = Vec::new();

    lines.push(format!("Evaluated Runs: {}", summary.total_runs));
    if !summary.excluded_runs.is_empty() {
        lines.push(format!(
            "Excluded Runs: {} ({})",
            summary.excluded_runs.len(),
            summary.excluded_runs.join(", ")
        ));
    }

    if !summary.by_class.is_empty() {
        lines.push(String::new());
        lines.push("By Class:".to_string());

        let mut classes: Vec<_> = summary.by_class.iter().collect();
        classes.sort_by_key(|(_, count)| std::cmp::Reverse(**count));

        for (class_tag, count) in classes {
            lines.push(format!("- {}: {}", class_tag, count));
        }
    }

    if !summary.macro_avgs.is_empty() {
        lines.push(String::new());
        lines.push("Metric Means:".to_string());
        for name in Metrics::NAMES {
            if let Some(mean) = summary.macro_avgs.get(name) {
                lines.push(format!("- {}: {:.3}", name, mean));
            }
        }
    }

    let top = top_risk_tags(summary, 5);
    if !top.is_empty() {
        lines.push(String::new());
        lines.push("Top Emergent Risks:".to_string());
        for (tag, count) in top {
            lines.push(format!("- {}: {}", tag, count));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn evaluation(run_id: &str, class_tag: Option<&str>, score: f64, tags: &[&str]) -> Value {
        let mut value = json!({
            "run_id": run_id,
            "model": "judge",
            "metrics": {
                "compliance_score": score,
                "risk_identification_recall": score,
                "mitigation_quality": score,
                "coherence": score,
                "grounding": score,
                "action_validity": score
            },
            "violations": [
                {"policy": "p1", "severity": "high", "evidence": "e"},
                {"policy": "p2", "severity": "Low", "evidence": "e"}
            ],
            "emergent_risk_tags": tags,
            "judge_notes": ""
        });
        if let Some(tag) = class_tag {
            value["class_tag"] = json!(tag);
        }
        value
    }

    fn run(run_id: &str, manifest_class: Option<&str>, evaluation: Option<Value>) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            class_tag: manifest_class.map(String::from),
            evaluation,
            ..RunRecord::default()
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_aggregate_counts_and_means() {
        let runs = vec![
            run("1", None, Some(evaluation("1", Some("A"), 0.5, &["x"]))),
            run("2", None, Some(evaluation("2", Some("A"), 0.7, &["x", "y"]))),
            run("3", None, Some(evaluation("3", Some("B"), 0.9, &[]))),
        ];

        let summary = aggregate_runs(&runs);
        assert_eq!(summary.total_runs, 3);
        assert_eq!(summary.by_class.get("A"), Some(&2));
        assert_eq!(summary.by_class.get("B"), Some(&1));
        for name in Metrics::NAMES {
            assert!(approx(summary.macro_avgs[name], 0.7), "{} mean", name);
        }
        assert!(approx(summary.class_macro_avgs["A"]["coherence"], 0.6));
        assert!(approx(summary.class_macro_avgs["B"]["coherence"], 0.9));

        let expected_std = ((0.04 + 0.0 + 0.04) / 3.0_f64).sqrt();
        assert!(approx(summary.std_devs["grounding"], expected_std));

        assert_eq!(summary.emergent_risk_counts.get("x"), Some(&2));
        assert_eq!(summary.emergent_risk_counts.get("y"), Some(&1));
        assert_eq!(summary.severity_counts.get("high"), Some(&3));
        assert_eq!(summary.severity_counts.get("low"), Some(&3));
        assert_eq!(summary.severity_counts.get("critical"), Some(&0));
    }

    #[test]
    fn test_tags_count_once_per_run() {
        let runs = vec![run(
            "1",
            None,
            Some(evaluation("1", Some("A"), 0.5, &["loop", " loop ", "loop"])),
        )];
        let summary = aggregate_runs(&runs);
        assert_eq!(summary.emergent_risk_counts.get("loop"), Some(&1));
        assert_eq!(summary.emergent_risk_counts.len(), 1);
    }

    #[test]
    fn test_class_resolution_order() {
        let runs = vec![
            run("1", Some("Manifest"), Some(evaluation("1", Some("Stamped"), 0.5, &[]))),
            run("2", Some("Manifest"), Some(evaluation("2", None, 0.5, &[]))),
            run("3", None, Some(evaluation("3", None, 0.5, &[]))),
        ];
        let summary = aggregate_runs(&runs);
        assert_eq!(summary.by_class.get("Stamped"), Some(&1));
        assert_eq!(summary.by_class.get("Manifest"), Some(&1));
        assert_eq!(summary.by_class.get(UNKNOWN_CLASS), Some(&1));
    }

    #[test]
    fn test_invalid_runs_are_excluded() {
        let mut bad = evaluation("2", Some("A"), 0.5, &["x"]);
        bad["metrics"]["coherence"] = json!(3.0);

        let runs = vec![
            run("1", None, Some(evaluation("1", Some("A"), 0.4, &[]))),
            run("2", None, Some(bad)),
            run("3", None, Some(Value::Null)),
            run("4", None, None),
        ];
        let summary = aggregate_runs(&runs);
        assert_eq!(summary.total_runs, 1);
        assert_eq!(summary.excluded_runs, vec!["2", "3"]);
        assert_eq!(summary.stage_counts.get("evaluation"), Some(&3));
        assert_eq!(summary.stage_counts.get("scenario"), Some(&0));
        assert!(summary.emergent_risk_counts.is_empty());
        assert!(approx(summary.macro_avgs["coherence"], 0.4));
    }

    #[test]
    fn test_scenario_breakdown_counts_included_runs() {
        let mut bad = evaluation("3", Some("A"), 0.5, &[]);
        bad["metrics"] = json!({});

        let runs = vec![
            RunRecord {
                scenario: Some(json!({
                    "industry": "Finance",
                    "region": "EU",
                    "safety_criticality": "high",
                    "agent_type": ["not", "a", "label"]
                })),
                ..run("1", None, Some(evaluation("1", Some("A"), 0.5, &[])))
            },
            RunRecord {
                scenario: Some(json!({"industry": " Finance ", "region": "US", "attack_type": ""})),
                ..run("2", None, Some(evaluation("2", Some("A"), 0.5, &[])))
            },
            RunRecord {
                scenario: Some(json!({"industry": "Healthcare"})),
                ..run("3", None, Some(bad))
            },
            RunRecord {
                scenario: Some(json!({"industry": "Energy"})),
                ..run("4", None, None)
            },
        ];

        let summary = aggregate_runs(&runs);
        let breakdown = &summary.scenario_breakdown;
        assert_eq!(breakdown.len(), SCENARIO_ATTRIBUTES.len());
        assert_eq!(breakdown["industry"].get("Finance"), Some(&2));
        assert_eq!(breakdown["industry"].len(), 1);
        assert_eq!(breakdown["region"].get("EU"), Some(&1));
        assert_eq!(breakdown["region"].get("US"), Some(&1));
        assert_eq!(breakdown["safety_criticality"].get("high"), Some(&1));
        assert!(breakdown["agent_type"].is_empty());
        assert!(breakdown["attack_type"].is_empty());
    }

    #[test]
    fn test_empty_corpus() {
        let summary = aggregate_runs(&[]);
        assert_eq!(summary.total_runs, 0);
        assert!(summary.macro_avgs.is_empty());
        assert!(summary.generated_at.is_some());
    }

    #[test]
    fn test_aggregate_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let manifests = store
            .allocate_runs(&["A".to_string(), "A".to_string(), "B".to_string()])
            .unwrap();
        for (manifest, score) in manifests.iter().zip([0.5, 0.7, 0.9]) {
            store
                .write(
                    &manifest.run_id,
                    ArtifactKind::Evaluation,
                    &evaluation(&manifest.run_id, None, score, &[]),
                )
                .unwrap();
        }

        let summary = aggregate(&store).unwrap();
        assert_eq!(summary.total_runs, 3);
        assert_eq!(summary.by_class.get("A"), Some(&2));
        assert!(approx(summary.macro_avgs["compliance_score"], 0.7));
    }

    #[test]
    fn test_unreadable_evaluation_is_excluded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        store.allocate_runs(&["A".to_string(), "B".to_string()]).unwrap();
        for id in ["1", "2"] {
            store
                .write(id, ArtifactKind::Evaluation, &evaluation(id, None, 0.5, &[]))
                .unwrap();
        }
        std::fs::write(
            store.artifact_path("2", ArtifactKind::Evaluation).unwrap(),
            [0xff, 0xfe, 0x7b],
        )
        .unwrap();

        let summary = aggregate(&store).unwrap();
        assert_eq!(summary.total_runs, 1);
        assert_eq!(summary.excluded_runs, vec!["2"]);
        assert_eq!(summary.by_class.get("A"), Some(&1));
    }

    #[test]
    fn test_top_risk_tags_and_text() {
        let runs = vec![
            run("1", None, Some(evaluation("1", Some("A"), 0.5, &["b", "a"]))),
            run("2", None, Some(evaluation("2", Some("A"), 0.5, &["b"]))),
        ];
        let summary = aggregate_runs(&runs);
        assert_eq!(top_risk_tags(&summary, 1), vec![("b", 2)]);

        let text = generate_summary_text(&summary);
        assert!(text.contains("Evaluated Runs: 2"));
        assert!(text.contains("- A: 2"));
        assert!(text.contains("- b: 2"));
    }
}
