//! The single stage function shared by all three pipeline stages.
//!
//! A stage differs from another only in the artifact it produces: which
//! prerequisites it reads, which template it renders and which schema its
//! output must satisfy.

use super::{StageError, StageOutcome};
use crate::llm::{InvocationContext, Invoker};
use crate::models::{ArtifactKind, WorkItem};
use crate::prompt;
use crate::store::RunStore;
use crate::validate::{self, Schema};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a stage needs besides the item itself.
pub struct StageContext {
    pub kind: ArtifactKind,
    pub store: Arc<RunStore>,
    pub invoker: Arc<Invoker>,
    pub template: String,
    pub overwrite: bool,
}

impl StageContext {
    pub fn new(kind: ArtifactKind, store: Arc<RunStore>, invoker: Arc<Invoker>, template: String) -> Self {
        Self {
            kind,
            store,
            invoker,
            template,
            overwrite: false,
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

/// Template variables a stage supplies.
pub fn available_variables(kind: ArtifactKind) -> Vec<&'static str> {
    let mut vars = vec!["run_id", "scenario_class", "model"];
    vars.extend(kind.prerequisites().iter().map(|k| k.prompt_variable()));
    vars
}

/// Rough token count used when the judge reports no operational data.
fn estimate_tokens(prompt: &str, response: &str) -> f64 {
    ((prompt.chars().count() + response.chars().count()) / 4) as f64
}

/// Produce one artifact for one run.
pub async fn execute(ctx: Arc<StageContext>, item: WorkItem) -> Result<StageOutcome, StageError> {
    let kind = ctx.kind;
    if item.stage != kind {
        return Err(StageError::Permanent(format!(
            "{} item routed to the {} stage",
            item.stage, kind
        )));
    }

    if ctx.store.exists(&item.run_id, kind) && !ctx.overwrite {
        debug!(run_id = %item.run_id, stage = %kind, "Artifact exists, skipping");
        return Ok(StageOutcome::Skipped);
    }

    let mut inputs = item.prompt_inputs.clone();
    inputs.insert("model".to_string(), ctx.invoker.model_id().to_string());

    for prerequisite in kind.prerequisites() {
        if !ctx.store.exists(&item.run_id, *prerequisite) {
            return Err(StageError::MissingPrerequisite(*prerequisite));
        }
        let value = ctx.store.read(&item.run_id, *prerequisite)?;
        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| StageError::Permanent(format!("cannot serialize {}: {}", prerequisite, e)))?;
        inputs.insert(prerequisite.prompt_variable().to_string(), text);
    }

    // Runs are only created by allocation; a stage never adds one.
    if !ctx.store.run_exists(&item.run_id) {
        return Err(StageError::UnknownRun(item.run_id.clone()));
    }

    let rendered = prompt::render(&ctx.template, &inputs)?;

    let invocation = InvocationContext {
        run_id: &item.run_id,
        stage: kind,
    };
    let raw = ctx.invoker.invoke(&rendered, &invocation).await?;

    let validated = validate::validate(&raw.text, Schema::for_kind(kind))?;
    let mut payload = validated.value;

    if kind == ArtifactKind::Evaluation {
        if let Value::Object(ref mut obj) = payload {
            if let Some(judged) = validated.evaluation.as_ref().map(|e| e.run_id.as_str()) {
                if judged != item.run_id {
                    warn!(run_id = %item.run_id, judged, "Judge reported a different run id");
                }
            }
            obj.insert("run_id".to_string(), Value::String(item.run_id.clone()));
            obj.insert("class_tag".to_string(), Value::String(item.class_tag.clone()));
            if validated.evaluation.as_ref().is_some_and(|e| e.operational.is_none()) {
                obj.insert(
                    "operational".to_string(),
                    json!({
                        "latency_ms": raw.latency.as_millis() as f64,
                        "token_cost_estimate": estimate_tokens(&rendered, &raw.text),
                    }),
                );
            }
        }
    }

    let path = ctx.store.write(&item.run_id, kind, &payload)?;
    info!(
        run_id = %item.run_id,
        stage = %kind,
        attempts = raw.attempts,
        path = %path.display(),
        "Saved artifact"
    );

    Ok(StageOutcome::Success(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::invoke::tests::ScriptedClient;
    use crate::llm::{ModelError, RetryPolicy};
    use crate::models::{BatchStats, InvocationStatus};
    use crate::pipeline::run_batch;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            attempt_timeout: Duration::from_secs(5),
            jitter: false,
        }
    }

    fn judge_output() -> String {
        json!({
            "run_id": "1",
            "model": "judge",
            "metrics": {
                "compliance_score": 0.9,
                "risk_identification_recall": 0.8,
                "mitigation_quality": 0.7,
                "coherence": 0.6,
                "grounding": 0.5,
                "action_validity": 0.4
            },
            "violations": [],
            "emergent_risk_tags": ["shadow_tool_use"],
            "judge_notes": "ok"
        })
        .to_string()
    }

    fn context(
        dir: &tempfile::TempDir,
        kind: ArtifactKind,
        template: &str,
        client: Arc<ScriptedClient>,
    ) -> Arc<StageContext> {
        let store = Arc::new(RunStore::open(dir.path()).unwrap());
        let invoker = Arc::new(Invoker::new(client, "test-model", policy()));
        Arc::new(StageContext::new(kind, store, invoker, template.to_string()))
    }

    fn allocate(ctx: &StageContext, n: usize) {
        ctx.store.allocate_runs(&vec!["A".to_string(); n]).unwrap();
    }

    #[test]
    fn test_available_variables() {
        assert_eq!(
            available_variables(ArtifactKind::Scenario),
            vec!["run_id", "scenario_class", "model"]
        );
        let eval = available_variables(ArtifactKind::Evaluation);
        assert!(eval.contains(&"scenario_json"));
        assert!(eval.contains(&"governance_json"));
    }

    #[tokio::test]
    async fn test_scenario_success_then_idempotent_skip() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Ok(
            "```json\n{\"title\": \"drift\"}\n```".to_string()
        )]));
        let ctx = context(&dir, ArtifactKind::Scenario, "Write a {scenario_class} scenario", client.clone());
        allocate(&ctx, 1);

        let item = WorkItem::new("1", "Goal Drift", ArtifactKind::Scenario);
        let first = execute(Arc::clone(&ctx), item.clone()).await.unwrap();
        assert_eq!(first, StageOutcome::Success(json!({"title": "drift"})));
        assert!(ctx.store.exists("1", ArtifactKind::Scenario));

        let second = execute(Arc::clone(&ctx), item).await.unwrap();
        assert_eq!(second, StageOutcome::Skipped);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overwrite_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(r#"{"v": 1}"#.to_string()),
            Ok(r#"{"v": 2}"#.to_string()),
        ]));
        let store = Arc::new(RunStore::open(dir.path()).unwrap());
        let invoker = Arc::new(Invoker::new(client, "m", policy()));
        let ctx = Arc::new(
            StageContext::new(ArtifactKind::Scenario, store, invoker, "go".to_string()).with_overwrite(true),
        );
        allocate(&ctx, 1);

        let item = WorkItem::new("1", "A", ArtifactKind::Scenario);
        execute(Arc::clone(&ctx), item.clone()).await.unwrap();
        execute(Arc::clone(&ctx), item).await.unwrap();
        assert_eq!(ctx.store.read("1", ArtifactKind::Scenario).unwrap()["v"], 2);
    }

    #[tokio::test]
    async fn test_scenario_for_unknown_run_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Ok(r#"{"title": "t"}"#.to_string())]));
        let store = Arc::new(RunStore::open(dir.path()).unwrap());
        let invoker = Arc::new(Invoker::new(client.clone(), "m", policy()));
        let ctx = Arc::new(
            StageContext::new(ArtifactKind::Scenario, store, invoker, "go".to_string()).with_overwrite(true),
        );

        let err = execute(Arc::clone(&ctx), WorkItem::new("99", "A", ArtifactKind::Scenario))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::UnknownRun(ref id) if id == "99"));
        assert_eq!(err.status(), InvocationStatus::PermanentFailure);
        assert!(ctx.store.list_run_ids().unwrap().is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_evaluation_run_id_follows_the_run() {
        let dir = tempfile::tempdir().unwrap();
        // The judge echoes the id from its example instead of the real one.
        let client = Arc::new(ScriptedClient::new(vec![Ok(judge_output())]));
        let ctx = context(&dir, ArtifactKind::Evaluation, "{scenario_json}{governance_json}", client);
        ctx.store.write("5", ArtifactKind::Scenario, &json!({})).unwrap();
        ctx.store.write("5", ArtifactKind::Governance, &json!([])).unwrap();

        execute(Arc::clone(&ctx), WorkItem::new("5", "A", ArtifactKind::Evaluation))
            .await
            .unwrap();

        let stored = ctx.store.read("5", ArtifactKind::Evaluation).unwrap();
        assert_eq!(stored["run_id"], "5");
    }

    #[tokio::test]
    async fn test_missing_prerequisite_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Ok("[]".to_string())]));
        let ctx = context(&dir, ArtifactKind::Governance, "{scenario_json}", client.clone());

        let err = execute(ctx, WorkItem::new("1", "A", ArtifactKind::Governance))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MissingPrerequisite(ArtifactKind::Scenario)));
        assert_eq!(err.status(), InvocationStatus::PermanentFailure);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_governance_receives_scenario_and_accepts_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Ok(
            r#"Trace: [{"step": 1, "type": "MI9_GOVERNANCE"}]"#.to_string()
        )]));
        let ctx = context(&dir, ArtifactKind::Governance, "Trace this: {scenario_json}", client);
        ctx.store.write("1", ArtifactKind::Scenario, &json!({"title": "t"})).unwrap();

        let outcome = execute(Arc::clone(&ctx), WorkItem::new("1", "A", ArtifactKind::Governance))
            .await
            .unwrap();
        assert!(matches!(outcome, StageOutcome::Success(Value::Array(_))));
    }

    #[tokio::test]
    async fn test_unknown_placeholder_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Ok("{}".to_string())]));
        let ctx = context(&dir, ArtifactKind::Scenario, "Hello {nobody}", client);
        allocate(&ctx, 1);

        let err = execute(ctx, WorkItem::new("1", "A", ArtifactKind::Scenario))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Render(_)));
    }

    #[tokio::test]
    async fn test_invalid_judge_output_is_validation_failure() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Ok(
            r#"{"run_id": "1", "model": "m", "metrics": {}}"#.to_string()
        )]));
        let ctx = context(&dir, ArtifactKind::Evaluation, "{scenario_json}{governance_json}", client);
        ctx.store.write("1", ArtifactKind::Scenario, &json!({})).unwrap();
        ctx.store.write("1", ArtifactKind::Governance, &json!([])).unwrap();

        let err = execute(Arc::clone(&ctx), WorkItem::new("1", "A", ArtifactKind::Evaluation))
            .await
            .unwrap_err();
        assert_eq!(err.status(), InvocationStatus::ValidationFailure);
        assert!(!ctx.store.exists("1", ArtifactKind::Evaluation));
    }

    #[tokio::test]
    async fn test_evaluation_is_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Ok(judge_output())]));
        let ctx = context(&dir, ArtifactKind::Evaluation, "{scenario_json}\n{governance_json}", client);
        ctx.store.write("1", ArtifactKind::Scenario, &json!({"s": 1})).unwrap();
        ctx.store.write("1", ArtifactKind::Governance, &json!([{"g": 1}])).unwrap();

        execute(Arc::clone(&ctx), WorkItem::new("1", "Goal Drift", ArtifactKind::Evaluation))
            .await
            .unwrap();

        let stored = ctx.store.read("1", ArtifactKind::Evaluation).unwrap();
        assert_eq!(stored["class_tag"], "Goal Drift");
        assert!(stored["operational"]["latency_ms"].as_f64().unwrap() >= 0.0);
        assert!(stored["operational"]["token_cost_estimate"].as_f64().unwrap() > 0.0);
        assert!(validate::validate_value(stored, Schema::Evaluation).is_ok());
    }

    #[tokio::test]
    async fn test_transient_exhaustion_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Err(ModelError::RateLimited { retry_after: None })]));
        let ctx = context(&dir, ArtifactKind::Scenario, "go", client.clone());
        allocate(&ctx, 1);

        let err = execute(ctx, WorkItem::new("1", "A", ArtifactKind::Scenario))
            .await
            .unwrap_err();
        assert_eq!(err.status(), InvocationStatus::TransientFailure);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_batch_through_stage_function() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::new(vec![Ok(r#"{"ok": true}"#.to_string())]));
        let ctx = context(&dir, ArtifactKind::Scenario, "{run_id}", client);
        allocate(&ctx, 3);
        ctx.store.write("2", ArtifactKind::Scenario, &json!({"existing": true})).unwrap();

        let items: Vec<_> = (1..=3)
            .map(|i| WorkItem::new(i.to_string(), "A", ArtifactKind::Scenario))
            .collect();
        let stage_ctx = Arc::clone(&ctx);
        let results = run_batch(items, 2, move |item| execute(Arc::clone(&stage_ctx), item))
            .await
            .unwrap();

        let stats = BatchStats::from_results(&results);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failures(), 0);
    }
}
