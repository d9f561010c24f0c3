//! Candidate-model fallback with per-model retries.
//!
//! A generation call walks an explicit plan of `(model, attempt)` pairs:
//! every attempt for the primary model, then every attempt for each fallback
//! in configured order. The first response that survives sanitization wins.

use super::{BackendError, GenerateOptions, ModelBackend};
use crate::config::ModelConfig;
use crate::generation::sanitize::sanitize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How many times each model is tried and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per model (at least 1)
    pub max_attempts: u32,
    /// Linear backoff step: attempt `n` waits `n * backoff_unit` before the next
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_unit,
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.max_retries, Duration::from_secs(1))
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(attempt)
    }

    /// Whether another attempt on the same model follows `attempt`
    pub fn has_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// One scheduled call: which model, and which try for that model (1-based)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub model: String,
    pub number: u32,
}

/// Every attempt for the first candidate, then every attempt for the next.
pub fn attempt_plan<'a>(
    candidates: &'a [String],
    policy: &RetryPolicy,
) -> impl Iterator<Item = Attempt> + 'a {
    let max_attempts = policy.max_attempts;
    candidates.iter().flat_map(move |model| {
        (1..=max_attempts).map(move |number| Attempt {
            model: model.clone(),
            number,
        })
    })
}

/// Keep the requested models the backend can serve, in requested order.
pub fn available_candidates(requested: &[String], available: &[String]) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    for model in requested {
        if available.contains(model) && !candidates.contains(model) {
            candidates.push(model.clone());
        }
    }
    candidates
}

/// Everything needed to generate tests for one source unit.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Primary model first, then fallbacks
    pub models: Vec<String>,
    pub options: GenerateOptions,
    /// Deadline for a single attempt
    pub timeout: Duration,
}

impl GenerationRequest {
    pub fn new(prompt: String, config: &ModelConfig) -> Self {
        Self {
            prompt,
            models: config.requested_models(),
            options: GenerateOptions::from_config(config),
            timeout: Duration::from_secs(config.timeout_minutes.saturating_mul(60)),
        }
    }
}

/// A sanitized, validated response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub code: String,
    /// Model that produced `code`
    pub model: String,
    /// Attempts that failed before this one succeeded
    pub failed_attempts: u32,
}

/// Why a single attempt did not produce usable code
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("response does not contain valid test code")]
    Malformed,
}

/// Terminal failure of a generation call
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to list available models: {0}")]
    ListModels(#[source] BackendError),

    #[error("none of the requested models are available: {}", requested.join(", "))]
    NoCandidates { requested: Vec<String> },

    #[error("failed to generate tests with all models after {attempts} attempts. Last error: {last}")]
    Exhausted { attempts: u32, last: AttemptError },
}

/// Runs a generation request across candidate models.
#[derive(Clone)]
pub struct ModelOrchestrator {
    backend: Arc<dyn ModelBackend>,
    policy: RetryPolicy,
}

impl ModelOrchestrator {
    pub fn new(backend: Arc<dyn ModelBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Try each available candidate model in priority order until one
    /// returns sanitized test code.
    pub async fn generate(&self, request: &GenerationRequest) -> Result<Generated, GenerationError> {
        // Availability is fetched once per call and never cached across calls
        let available = self
            .backend
            .list_models()
            .await
            .map_err(GenerationError::ListModels)?;

        let candidates = available_candidates(&request.models, &available);
        tracing::debug!("Available models from server: {:?}", available);

        if candidates.is_empty() {
            return Err(GenerationError::NoCandidates {
                requested: request.models.clone(),
            });
        }
        tracing::info!("Models to try in order: {:?}", candidates);

        let mut failed_attempts = 0;
        let mut last_error = None;

        for attempt in attempt_plan(&candidates, &self.policy) {
            tracing::debug!(
                "Attempt {}/{} with model {}",
                attempt.number,
                self.policy.max_attempts,
                attempt.model
            );

            match self.try_attempt(&attempt.model, request).await {
                Ok(code) => {
                    tracing::info!(
                        "Generated tests with model {} on attempt {}",
                        attempt.model,
                        attempt.number
                    );
                    return Ok(Generated {
                        code,
                        model: attempt.model,
                        failed_attempts,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Attempt {} failed with model {}: {}",
                        attempt.number,
                        attempt.model,
                        e
                    );
                    failed_attempts += 1;
                    last_error = Some(e);

                    if self.policy.has_retry_after(attempt.number) {
                        let wait = self.policy.backoff(attempt.number);
                        tracing::debug!("Waiting {:?} before retry", wait);
                        tokio::time::sleep(wait).await;
                    } else {
                        tracing::warn!("All attempts failed for model {}", attempt.model);
                    }
                }
            }
        }

        match last_error {
            Some(last) => Err(GenerationError::Exhausted {
                attempts: failed_attempts,
                last,
            }),
            None => Err(GenerationError::NoCandidates {
                requested: request.models.clone(),
            }),
        }
    }

    /// One bounded call plus sanitization
    async fn try_attempt(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<String, AttemptError> {
        let response = tokio::time::timeout(
            request.timeout,
            self.backend
                .generate(model, &request.prompt, &request.options),
        )
        .await
        .map_err(|_| BackendError::Timeout(request.timeout))??;

        if response.trim().is_empty() {
            return Err(BackendError::EmptyResponse.into());
        }

        let sanitized = sanitize(&response);
        if !sanitized.ok {
            return Err(AttemptError::Malformed);
        }

        tracing::debug!(
            "Sanitized response: {} -> {} bytes",
            response.len(),
            sanitized.code.len()
        );
        Ok(sanitized.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::{calls_by_model, StubBackend};

    const GOOD: &str = "```cpp\n#include \"calc.h\"\nTEST(Calc, Adds) {\n  EXPECT_EQ(add(1, 2), 3);\n}\n```";

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn request(names: &[&str]) -> GenerationRequest {
        GenerationRequest {
            prompt: "write tests".to_string(),
            models: models(names),
            options: GenerateOptions::default(),
            timeout: Duration::from_secs(5),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    // =========================================================================
    // Policy and plan tests
    // =========================================================================

    #[test]
    fn test_backoff_is_linear() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert!(policy.has_retry_after(2));
        assert!(!policy.has_retry_after(3));
    }

    #[test]
    fn test_policy_needs_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn test_attempt_plan_order() {
        let candidates = models(&["primary", "fallback"]);
        let plan: Vec<_> = attempt_plan(&candidates, &fast_policy(2))
            .map(|a| (a.model, a.number))
            .collect();
        assert_eq!(
            plan,
            vec![
                ("primary".to_string(), 1),
                ("primary".to_string(), 2),
                ("fallback".to_string(), 1),
                ("fallback".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_available_candidates_keeps_priority_order() {
        let requested = models(&["c", "a", "b", "a"]);
        let available = models(&["a", "b", "c"]);
        assert_eq!(available_candidates(&requested, &available), models(&["c", "a", "b"]));
    }

    #[test]
    fn test_available_candidates_filters_missing() {
        let requested = models(&["primary", "fallback"]);
        let available = models(&["fallback", "other"]);
        assert_eq!(available_candidates(&requested, &available), models(&["fallback"]));
    }

    #[test]
    fn test_request_from_config() {
        let config = ModelConfig {
            primary_model: "p".to_string(),
            fallback_models: vec!["f".to_string()],
            timeout_minutes: 2,
            ..Default::default()
        };
        let request = GenerationRequest::new("prompt".to_string(), &config);
        assert_eq!(request.models, models(&["p", "f"]));
        assert_eq!(request.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let config = ModelConfig {
            timeout_minutes: u64::MAX,
            ..Default::default()
        };
        let request = GenerationRequest::new("prompt".to_string(), &config);
        assert_eq!(request.timeout, Duration::from_secs(u64::MAX));
    }

    // =========================================================================
    // Orchestration tests
    // =========================================================================

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let backend = Arc::new(StubBackend::new(&["primary", "fallback"], |_, _, _| {
            Ok(GOOD.to_string())
        }));
        let orchestrator = ModelOrchestrator::new(backend.clone(), fast_policy(3));

        let generated = orchestrator.generate(&request(&["primary", "fallback"])).await.unwrap();

        assert_eq!(generated.model, "primary");
        assert_eq!(generated.failed_attempts, 0);
        assert!(generated.code.starts_with("#include \"calc.h\""));
        assert_eq!(backend.calls(), models(&["primary"]));
    }

    #[tokio::test]
    async fn test_unavailable_primary_falls_back_after_one_failure() {
        let backend = Arc::new(StubBackend::new(&["fallback"], |_, _, call| {
            if call == 0 {
                Err(BackendError::Unreachable("connection reset".to_string()))
            } else {
                Ok(GOOD.to_string())
            }
        }));
        let orchestrator = ModelOrchestrator::new(backend.clone(), fast_policy(2));

        let generated = orchestrator.generate(&request(&["primary", "fallback"])).await.unwrap();

        assert_eq!(generated.model, "fallback");
        assert_eq!(generated.failed_attempts, 1);
        assert_eq!(backend.calls(), models(&["fallback", "fallback"]));
    }

    #[tokio::test]
    async fn test_retries_exhaust_before_next_model() {
        let backend = Arc::new(StubBackend::new(&["a", "b"], |model, _, _| {
            if model == "a" {
                Ok("I'm sorry, I can't do that.".to_string())
            } else {
                Ok(GOOD.to_string())
            }
        }));
        let orchestrator = ModelOrchestrator::new(backend.clone(), fast_policy(3));

        let generated = orchestrator.generate(&request(&["a", "b"])).await.unwrap();

        assert_eq!(generated.model, "b");
        assert_eq!(generated.failed_attempts, 3);
        assert_eq!(backend.calls(), models(&["a", "a", "a", "b"]));
    }

    #[tokio::test]
    async fn test_exhaustion_carries_last_error() {
        let backend = Arc::new(StubBackend::new(&["a", "b"], |model, _, _| {
            if model == "a" {
                Err(BackendError::Unreachable("down".to_string()))
            } else {
                Ok(String::new())
            }
        }));
        let orchestrator = ModelOrchestrator::new(backend.clone(), fast_policy(2));

        let err = orchestrator.generate(&request(&["a", "b"])).await.unwrap_err();

        match err {
            GenerationError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(matches!(
                    last,
                    AttemptError::Backend(BackendError::EmptyResponse)
                ));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        let counts = calls_by_model(&backend.calls());
        assert_eq!(counts["a"], 2);
        assert_eq!(counts["b"], 2);
    }

    #[tokio::test]
    async fn test_no_candidates_available() {
        let backend = Arc::new(StubBackend::new(&["unrelated"], |_, _, _| Ok(GOOD.to_string())));
        let orchestrator = ModelOrchestrator::new(backend.clone(), fast_policy(2));

        let err = orchestrator.generate(&request(&["a"])).await.unwrap_err();

        assert!(matches!(err, GenerationError::NoCandidates { .. }));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lists_models_once_per_call() {
        let backend = Arc::new(StubBackend::new(&["a"], |_, _, _| Ok(GOOD.to_string())));
        let orchestrator = ModelOrchestrator::new(backend.clone(), fast_policy(2));

        orchestrator.generate(&request(&["a"])).await.unwrap();
        orchestrator.generate(&request(&["a"])).await.unwrap();

        assert_eq!(backend.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_between_attempts_only() {
        use std::sync::Mutex;
        use tokio::time::Instant;

        let start = Instant::now();
        let log: Arc<Mutex<Vec<(String, Duration)>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&log);
        let backend = Arc::new(StubBackend::new(&["primary", "fallback"], move |model, _, _| {
            recorder
                .lock()
                .unwrap()
                .push((model.to_string(), start.elapsed()));
            Err(BackendError::Unreachable("down".to_string()))
        }));
        let orchestrator =
            ModelOrchestrator::new(backend, RetryPolicy::new(3, Duration::from_secs(1)));

        let err = orchestrator
            .generate(&request(&["primary", "fallback"]))
            .await
            .unwrap_err();
        let finished = start.elapsed();

        assert!(matches!(err, GenerationError::Exhausted { attempts: 6, .. }));
        // Whole seconds of virtual time; timer granularity is a millisecond
        let secs = |d: Duration| d.as_secs_f64().round() as u64;
        let timeline: Vec<(String, u64)> = log
            .lock()
            .unwrap()
            .iter()
            .map(|(model, at)| (model.clone(), secs(*at)))
            .collect();
        assert_eq!(
            timeline,
            vec![
                ("primary".to_string(), 0),
                ("primary".to_string(), 1),
                ("primary".to_string(), 3),
                // No wait when switching models
                ("fallback".to_string(), 3),
                ("fallback".to_string(), 4),
                ("fallback".to_string(), 6),
            ]
        );
        // Nor after the final attempt
        assert_eq!(secs(finished), 6);
    }

    #[tokio::test]
    async fn test_timed_out_attempt_is_retried() {
        struct SlowFirst {
            calls: std::sync::atomic::AtomicUsize,
        }

        #[async_trait::async_trait]
        impl ModelBackend for SlowFirst {
            async fn list_models(&self) -> Result<Vec<String>, BackendError> {
                Ok(vec!["a".to_string()])
            }

            async fn generate(
                &self,
                _model: &str,
                _prompt: &str,
                _options: &GenerateOptions,
            ) -> Result<String, BackendError> {
                let call = self
                    .calls
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if call == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(GOOD.to_string())
            }
        }

        let backend = Arc::new(SlowFirst {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let orchestrator = ModelOrchestrator::new(backend, fast_policy(2));
        let mut req = request(&["a"]);
        req.timeout = Duration::from_millis(50);

        let generated = orchestrator.generate(&req).await.unwrap();

        assert_eq!(generated.failed_attempts, 1);
    }
}
