//! Model invocation with per-attempt timeout and retry.
//!
//! Each invocation is driven by a small state machine:
//!
//! ```text
//! Pending -> Attempting(n) -> Succeeded
//!                          -> Retrying(n, delay) -> Attempting(n + 1)
//!                          -> PermanentFailure
//!                          -> Exhausted
//! ```
//!
//! [`RetryPolicy::transition`] is pure apart from jitter, so the retry rules
//! can be tested without a network.

use super::audit::{AuditRecord, AuditSink};
use super::client::{ModelClient, ModelError};
use crate::models::ArtifactKind;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry and timeout settings for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(120),
            jitter: true,
        }
    }
}

/// Where an invocation currently is.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, delay: Duration, error: ModelError },
    Succeeded { attempt: u32, raw: String },
    PermanentFailure { attempt: u32, error: ModelError },
    Exhausted { attempts: u32, error: ModelError },
}

impl RetryPolicy {
    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Equal jitter: a random delay in `[delay / 2, delay]`.
    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let spread = (delay - half).as_millis() as u64;
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// Delay before retrying after `error`, honouring a provider `retry-after`.
    pub fn delay_for(&self, attempt: u32, error: &ModelError) -> Duration {
        let delay = self.jittered(self.backoff(attempt));
        match error.retry_after() {
            Some(hint) if hint > delay => hint.min(self.max_delay),
            _ => delay,
        }
    }

    /// Next state after attempt `attempt` finished with `outcome`.
    pub fn transition(&self, attempt: u32, outcome: Result<String, ModelError>) -> AttemptState {
        match outcome {
            Ok(raw) => AttemptState::Succeeded { attempt, raw },
            Err(error) if !error.is_transient() => AttemptState::PermanentFailure { attempt, error },
            Err(error) if attempt >= self.attempts() => AttemptState::Exhausted {
                attempts: attempt,
                error,
            },
            Err(error) => AttemptState::Retrying {
                attempt,
                delay: self.delay_for(attempt, &error),
                error,
            },
        }
    }
}

/// Successful raw model output.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub text: String,
    pub attempts: u32,
    /// Time from first attempt to success, including backoff.
    pub latency: Duration,
}

/// Terminal invocation failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvocationError {
    #[error("transient failure after {attempts} attempt(s): {error}")]
    Transient { attempts: u32, error: ModelError },

    #[error("permanent failure on attempt {attempt}: {error}")]
    Permanent { attempt: u32, error: ModelError },
}

/// Identifies an invocation in logs and the audit trail.
#[derive(Debug, Clone, Copy)]
pub struct InvocationContext<'a> {
    pub run_id: &'a str,
    pub stage: ArtifactKind,
}

/// Wraps a [`ModelClient`] with the retry policy and optional auditing.
pub struct Invoker {
    client: Arc<dyn ModelClient>,
    model_id: String,
    policy: RetryPolicy,
    audit: Option<Arc<AuditSink>>,
}

impl Invoker {
    pub fn new(client: Arc<dyn ModelClient>, model_id: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            client,
            model_id: model_id.into(),
            policy,
            audit: None,
        }
    }

    pub fn with_audit(mut self, sink: Arc<AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Call the model until success, a permanent error, or the attempt limit.
    pub async fn invoke(
        &self,
        prompt: &str,
        ctx: &InvocationContext<'_>,
    ) -> Result<RawResponse, InvocationError> {
        let started = Instant::now();
        let mut state = AttemptState::Pending;

        loop {
            state = match state {
                AttemptState::Pending => AttemptState::Attempting { attempt: 1 },
                AttemptState::Attempting { attempt } => {
                    debug!(
                        run_id = ctx.run_id,
                        stage = %ctx.stage,
                        attempt,
                        provider = self.client.name(),
                        "Invoking model"
                    );
                    let outcome = match tokio::time::timeout(
                        self.policy.attempt_timeout,
                        self.client.generate(prompt, &self.model_id),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ModelError::Timeout(self.policy.attempt_timeout)),
                    };
                    self.audit_attempt(ctx, attempt, prompt, &outcome).await;
                    self.policy.transition(attempt, outcome)
                }
                AttemptState::Retrying {
                    attempt,
                    delay,
                    error,
                } => {
                    warn!(
                        run_id = ctx.run_id,
                        stage = %ctx.stage,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient model failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    AttemptState::Attempting {
                        attempt: attempt + 1,
                    }
                }
                AttemptState::Succeeded { attempt, raw } => {
                    return Ok(RawResponse {
                        text: raw,
                        attempts: attempt,
                        latency: started.elapsed(),
                    });
                }
                AttemptState::PermanentFailure { attempt, error } => {
                    return Err(InvocationError::Permanent { attempt, error });
                }
                AttemptState::Exhausted { attempts, error } => {
                    return Err(InvocationError::Transient { attempts, error });
                }
            };
        }
    }

    async fn audit_attempt(
        &self,
        ctx: &InvocationContext<'_>,
        attempt: u32,
        prompt: &str,
        outcome: &Result<String, ModelError>,
    ) {
        let Some(sink) = &self.audit else {
            return;
        };

        let (raw_response, outcome) = match outcome {
            Ok(raw) => (Some(raw.as_str()), "success".to_string()),
            Err(e) => (None, e.to_string()),
        };

        sink.record(&AuditRecord {
            timestamp: Utc::now(),
            run_id: ctx.run_id,
            stage: ctx.stage,
            attempt,
            model: &self.model_id,
            prompt,
            raw_response,
            outcome,
        })
        .await;
    }
}
