//! Extraction and validation of model output.
//!
//! Model responses are free-form text that usually, but not always, wrap a
//! JSON document in prose or a markdown fence. [`validate`] pulls out the
//! document and checks it against the contract of the stage that produced
//! it. Validation is pure and never clamps or rewrites values.

use crate::models::{ArtifactKind, Evaluation, Metrics, Operational, Severity, Violation};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use thiserror::Error;

/// The contract a payload is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// Any JSON object or array of objects.
    Structured,
    /// The strict judge contract.
    Evaluation,
}

impl Schema {
    pub fn for_kind(kind: ArtifactKind) -> Self {
        match kind {
            ArtifactKind::Scenario | ArtifactKind::Governance => Schema::Structured,
            ArtifactKind::Evaluation => Schema::Evaluation,
        }
    }
}

/// A payload rejected by validation. `path` names the offending key.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: {reason}")]
pub struct ValidationFailure {
    pub path: String,
    pub reason: String,
}

impl ValidationFailure {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// A payload that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPayload {
    pub value: Value,
    /// Typed view, present for [`Schema::Evaluation`].
    pub evaluation: Option<Evaluation>,
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
    })
}

/// Whether an extracted value is a plausible document rather than stray
/// bracketed prose such as `[1]`.
fn is_document(value: &Value, schema: Schema) -> bool {
    match value {
        Value::Object(_) => true,
        Value::Array(items) => {
            schema == Schema::Structured
                && !items.is_empty()
                && items.iter().all(|item| item.is_object() || item.is_array())
        }
        _ => false,
    }
}

/// Pull the first JSON document out of free-form text.
pub fn extract_json(raw: &str, schema: Schema) -> Option<Value> {
    for caps in fence_regex().captures_iter(raw) {
        let Some(body) = caps.get(1) else {
            continue;
        };
        if let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim()) {
            if is_document(&value, schema) {
                return Some(value);
            }
        }
    }

    for (i, c) in raw.char_indices() {
        if c != '{' && !(c == '[' && schema == Schema::Structured) {
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&raw[i..]).into_iter::<Value>();
        if let Some(Ok(value)) = stream.next() {
            if is_document(&value, schema) {
                return Some(value);
            }
        }
    }

    None
}

/// Extract and validate a raw model response.
pub fn validate(raw: &str, schema: Schema) -> Result<ValidatedPayload, ValidationFailure> {
    let value = extract_json(raw, schema).ok_or_else(|| {
        let reason = match schema {
            Schema::Structured => "no JSON object or array found in response",
            Schema::Evaluation => "no JSON object found in response",
        };
        ValidationFailure::new("$", reason)
    })?;
    validate_value(value, schema)
}

/// Validate an already-parsed value.
pub fn validate_value(value: Value, schema: Schema) -> Result<ValidatedPayload, ValidationFailure> {
    match schema {
        Schema::Structured => {
            if !is_document(&value, schema) {
                return Err(ValidationFailure::new("$", "expected a JSON object or array"));
            }
            Ok(ValidatedPayload {
                value,
                evaluation: None,
            })
        }
        Schema::Evaluation => {
            let evaluation = parse_evaluation(&value)?;
            Ok(ValidatedPayload {
                value,
                evaluation: Some(evaluation),
            })
        }
    }
}

fn field<'a>(obj: &'a Map<String, Value>, path: &str, key: &str) -> Result<&'a Value, ValidationFailure> {
    obj.get(key)
        .ok_or_else(|| ValidationFailure::new(join(path, key), "missing"))
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn string(value: &Value, path: &str) -> Result<String, ValidationFailure> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ValidationFailure::new(path, "expected a string"))
}

fn number(value: &Value, path: &str) -> Result<f64, ValidationFailure> {
    match value.as_f64() {
        Some(n) if n.is_finite() => Ok(n),
        _ => Err(ValidationFailure::new(path, "expected a number")),
    }
}

fn object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, ValidationFailure> {
    value
        .as_object()
        .ok_or_else(|| ValidationFailure::new(path, "expected an object"))
}

fn array<'a>(value: &'a Value, path: &str) -> Result<&'a Vec<Value>, ValidationFailure> {
    value
        .as_array()
        .ok_or_else(|| ValidationFailure::new(path, "expected an array"))
}

fn parse_metrics(value: &Value) -> Result<Metrics, ValidationFailure> {
    let obj = object(value, "metrics")?;
    let score = |key: &str| -> Result<f64, ValidationFailure> {
        let path = join("metrics", key);
        let n = number(field(obj, "metrics", key)?, &path)?;
        if !(0.0..=1.0).contains(&n) {
            return Err(ValidationFailure::new(path, format!("{} is outside [0, 1]", n)));
        }
        Ok(n)
    };

    Ok(Metrics {
        compliance_score: score("compliance_score")?,
        risk_identification_recall: score("risk_identification_recall")?,
        mitigation_quality: score("mitigation_quality")?,
        coherence: score("coherence")?,
        grounding: score("grounding")?,
        action_validity: score("action_validity")?,
    })
}

fn parse_violations(value: &Value) -> Result<Vec<Violation>, ValidationFailure> {
    let items = array(value, "violations")?;
    let mut violations = Vec::with_capacity(items.len());

    for (i, item) in items.iter().enumerate() {
        let path = format!("violations[{}]", i);
        let obj = object(item, &path)?;
        let policy = string(field(obj, &path, "policy")?, &join(&path, "policy"))?;
        let evidence = string(field(obj, &path, "evidence")?, &join(&path, "evidence"))?;

        let severity_path = join(&path, "severity");
        let raw = string(field(obj, &path, "severity")?, &severity_path)?;
        let severity = Severity::parse(&raw).ok_or_else(|| {
            ValidationFailure::new(
                &severity_path,
                format!("'{}' is not one of low, medium, high, critical", raw),
            )
        })?;

        violations.push(Violation {
            policy,
            severity,
            evidence,
        });
    }

    Ok(violations)
}

fn parse_tags(value: &Value) -> Result<Vec<String>, ValidationFailure> {
    let items = array(value, "emergent_risk_tags")?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let path = format!("emergent_risk_tags[{}]", i);
            let tag = string(item, &path)?;
            if tag.trim().is_empty() {
                return Err(ValidationFailure::new(path, "tag is empty"));
            }
            Ok(tag)
        })
        .collect()
}

fn parse_operational(value: &Value) -> Result<Operational, ValidationFailure> {
    let obj = object(value, "operational")?;
    let non_negative = |key: &str| -> Result<f64, ValidationFailure> {
        let path = join("operational", key);
        let n = number(field(obj, "operational", key)?, &path)?;
        if n < 0.0 {
            return Err(ValidationFailure::new(path, "must not be negative"));
        }
        Ok(n)
    };

    Ok(Operational {
        latency_ms: non_negative("latency_ms")?,
        token_cost_estimate: non_negative("token_cost_estimate")?,
    })
}

/// Check a value against the judge contract and build the typed view.
pub fn parse_evaluation(value: &Value) -> Result<Evaluation, ValidationFailure> {
    let obj = object(value, "$")?;

    let run_id = string(field(obj, "", "run_id")?, "run_id")?;
    let model = string(field(obj, "", "model")?, "model")?;
    let metrics = parse_metrics(field(obj, "", "metrics")?)?;
    let violations = parse_violations(field(obj, "", "violations")?)?;
    let emergent_risk_tags = parse_tags(field(obj, "", "emergent_risk_tags")?)?;

    let operational = match obj.get("operational") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_operational(v)?),
    };

    let judge_notes = string(field(obj, "", "judge_notes")?, "judge_notes")?;

    let class_tag = match obj.get("class_tag") {
        None | Some(Value::Null) => None,
        Some(v) => Some(string(v, "class_tag")?),
    };

    Ok(Evaluation {
        run_id,
        model,
        class_tag,
        metrics,
        violations,
        emergent_risk_tags,
        operational,
        judge_notes,
    })
}
