//! The request-serving pipeline.
//!
//! For one admitted request: fingerprint, consult the cache according to the
//! request's policy, coalesce concurrent misses through single-flight,
//! resolve the model, assemble the persona prompt, call the backend, commit
//! the result to the cache, and emit metrics. Admission and rate limiting
//! happen before a request reaches this type; retries happen below it, in
//! the backend client.

pub mod batch;

use std::{sync::Arc, time::Instant};

use validator::Validate;

use crate::{
    api_types::{CachePolicy, CacheStatus, GenerateResponse, GenerationRequest},
    backend::{BackendClient, BackendError, GenerationOptions},
    cache::{CachedCompletion, LookupResult, ResponseCache, SingleFlightRegistry},
    config::LimitsConfig,
    error::GatewayError,
    fingerprint::{Fingerprint, Fingerprinter},
    observability::metrics,
    prompt::PromptAssembler,
    router::ModelRouter,
};

/// Shared outcome of one computed generation; what single-flight waiters
/// receive and what the cache stores.
type FlightResult = Result<CachedCompletion, GatewayError>;

/// Everything the single-flight leader's computation needs. Cloned into the
/// spawned task so the work outlives any individual caller.
#[derive(Clone)]
struct ComputeContext {
    cache: Arc<ResponseCache>,
    backend: Arc<dyn BackendClient>,
    router: Arc<ModelRouter>,
    assembler: PromptAssembler,
}

impl ComputeContext {
    /// Resolve, assemble, generate, and commit. On success the entry is in
    /// the cache before this returns, so every flight participant observes
    /// a committed write.
    async fn compute(
        self,
        request: GenerationRequest,
        fp: Fingerprint,
        write: WritePolicy,
    ) -> FlightResult {
        let resolved = self.router.resolve(&request.model)?;
        let prompt = self
            .assembler
            .assemble(&request.prompt, request.agent_profile.as_ref());
        let options = GenerationOptions::from_request(&request);

        match self
            .backend
            .generate(&resolved.backend_name, &prompt, &options)
            .await
        {
            Ok(result) => {
                metrics::record_tokens(
                    &request.model,
                    result.prompt_tokens,
                    result.completion_tokens,
                );

                let entry = CachedCompletion {
                    response_text: result.text,
                    model_used: result.model,
                    prompt_tokens: result.prompt_tokens,
                    completion_tokens: result.completion_tokens,
                    created_at: chrono::Utc::now().timestamp(),
                    ttl_secs: self.cache.default_ttl().as_secs(),
                };

                match write {
                    WritePolicy::None => {}
                    WritePolicy::IfAbsent => {
                        self.cache.store_success(&fp, &entry, false).await;
                    }
                    WritePolicy::Overwrite => {
                        self.cache.store_success(&fp, &entry, true).await;
                    }
                }

                Ok(entry)
            }
            Err(BackendError::Rejected { status, message }) => {
                if !matches!(write, WritePolicy::None) {
                    self.cache.store_negative(&fp, status, &message).await;
                }
                Err(GatewayError::BackendRejected { status, message })
            }
            Err(BackendError::Transient(reason)) => {
                // Retries are exhausted by the time this surfaces; gate the
                // model until the router sees it healthy again.
                self.router.mark_unavailable(&resolved.backend_name);
                Err(GatewayError::BackendError(reason))
            }
            Err(BackendError::DeadlineExceeded) => Err(GatewayError::Timeout { stage: "backend" }),
        }
    }
}

pub struct RequestPipeline {
    fingerprinter: Fingerprinter,
    flights: SingleFlightRegistry<FlightResult>,
    ctx: ComputeContext,
    limits: LimitsConfig,
}

impl RequestPipeline {
    pub fn new(
        fingerprinter: Fingerprinter,
        cache: Arc<ResponseCache>,
        backend: Arc<dyn BackendClient>,
        router: Arc<ModelRouter>,
        assembler: PromptAssembler,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            fingerprinter,
            flights: SingleFlightRegistry::new(),
            ctx: ComputeContext {
                cache,
                backend,
                router,
                assembler,
            },
            limits,
        }
    }

    /// Drive one request end to end.
    pub async fn execute(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerateResponse, GatewayError> {
        let started = Instant::now();
        metrics::record_pipeline_started();
        let result = self.execute_inner(&request, started).await;
        metrics::record_pipeline_finished();

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        metrics::record_request(&request.model, outcome, started.elapsed().as_secs_f64());

        result
    }

    async fn execute_inner(
        &self,
        request: &GenerationRequest,
        started: Instant,
    ) -> Result<GenerateResponse, GatewayError> {
        self.validate(request)?;

        let fp = self.fingerprinter.fingerprint(request);
        tracing::debug!(
            fingerprint = %fp,
            model = %request.model,
            cache_policy = ?request.cache_policy,
            "Request fingerprinted"
        );

        match request.cache_policy {
            CachePolicy::Bypass => {
                // No cache read, no cache write, no negative caching.
                metrics::record_cache_status("bypass");
                let entry = self
                    .ctx
                    .clone()
                    .compute(request.clone(), fp, WritePolicy::None)
                    .await?;
                Ok(respond(request, entry, CacheStatus::Bypass, started))
            }
            CachePolicy::Use => {
                match self.ctx.cache.lookup(&fp).await {
                    LookupResult::Hit(entry) => {
                        metrics::record_cache_status("hit");
                        return Ok(respond(request, entry, CacheStatus::Hit, started));
                    }
                    LookupResult::NegativeHit { status, message } => {
                        metrics::record_cache_status("negative_hit");
                        return Err(GatewayError::BackendRejected { status, message });
                    }
                    LookupResult::Miss => {}
                }

                metrics::record_cache_status("miss");
                let entry = self
                    .compute_single_flight(request, fp, WritePolicy::IfAbsent)
                    .await?;
                Ok(respond(request, entry, CacheStatus::Miss, started))
            }
            CachePolicy::Refresh => {
                metrics::record_cache_status("refresh");
                let entry = self
                    .compute_single_flight(request, fp, WritePolicy::Overwrite)
                    .await?;
                Ok(respond(request, entry, CacheStatus::Refresh, started))
            }
        }
    }

    /// Ceilings that depend on configuration; structural validation comes
    /// from the payload types.
    fn validate(&self, request: &GenerationRequest) -> Result<(), GatewayError> {
        request
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;

        if request.effective_max_tokens() > self.limits.max_tokens_ceiling {
            return Err(GatewayError::Validation(format!(
                "max_tokens exceeds the server ceiling of {}",
                self.limits.max_tokens_ceiling
            )));
        }
        if request.prompt.len() > self.limits.max_prompt_chars {
            return Err(GatewayError::Validation(format!(
                "prompt exceeds {} characters",
                self.limits.max_prompt_chars
            )));
        }
        if let Some(profile) = &request.agent_profile
            && let Some(context) = &profile.context
            && context.len() > self.limits.max_context_chars
        {
            return Err(GatewayError::Validation(format!(
                "agent_profile.context exceeds {} characters",
                self.limits.max_context_chars
            )));
        }

        Ok(())
    }

    /// Join or lead the flight for this fingerprint. Every participant gets
    /// the same outcome.
    async fn compute_single_flight(
        &self,
        request: &GenerationRequest,
        fp: Fingerprint,
        write: WritePolicy,
    ) -> FlightResult {
        let ctx = self.ctx.clone();
        let request = request.clone();
        let outcome = self
            .flights
            .run(fp, ctx.compute(request, fp, write))
            .await;

        if outcome.coalesced {
            metrics::record_singleflight_coalesced();
            tracing::debug!(fingerprint = %fp, "Coalesced onto in-flight computation");
        }

        outcome.value
    }

    /// Test and readiness seam: the router this pipeline resolves with.
    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.ctx.router
    }
}

fn respond(
    request: &GenerationRequest,
    entry: CachedCompletion,
    cache_status: CacheStatus,
    started: Instant,
) -> GenerateResponse {
    GenerateResponse {
        response: entry.response_text,
        model: entry.model_used,
        cache_status,
        latency_ms: started.elapsed().as_millis() as u64,
        tokens: crate::api_types::TokenUsage {
            prompt: entry.prompt_tokens,
            completion: entry.completion_tokens,
        },
        request_id: request.request_id.clone(),
    }
}

/// How a computed result lands in the cache.
#[derive(Debug, Clone, Copy)]
enum WritePolicy {
    /// Bypass: the cache never learns about this request.
    None,
    /// Policy `use`: first committed entry wins.
    IfAbsent,
    /// Policy `refresh`: replace whatever is there.
    Overwrite,
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        api_types::CachePolicy, backend::GenerationResult, cache::MemoryCache,
        config::RouterConfig,
    };

    /// Scriptable backend: counts generate calls, optional latency, and a
    /// failure plan consumed call by call.
    struct StubBackend {
        calls: AtomicUsize,
        delay: Duration,
        plan: std::sync::Mutex<Vec<Result<String, BackendError>>>,
        fallback_text: String,
    }

    impl StubBackend {
        fn succeeding(text: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                plan: std::sync::Mutex::new(Vec::new()),
                fallback_text: text.to_string(),
            })
        }

        fn with_delay(text: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                plan: std::sync::Mutex::new(Vec::new()),
                fallback_text: text.to_string(),
            })
        }

        fn scripted(plan: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                plan: std::sync::Mutex::new(plan),
                fallback_text: "fallback".to_string(),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendClient for StubBackend {
        async fn generate(
            &self,
            model: &str,
            _prompt: &str,
            _options: &GenerationOptions,
        ) -> Result<GenerationResult, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let next = {
                let mut plan = self.plan.lock().unwrap();
                if plan.is_empty() {
                    None
                } else {
                    Some(plan.remove(0))
                }
            };
            match next {
                Some(Ok(text)) => Ok(GenerationResult {
                    text,
                    model: model.to_string(),
                    prompt_tokens: Some(10),
                    completion_tokens: Some(20),
                }),
                Some(Err(e)) => Err(e),
                None => Ok(GenerationResult {
                    text: self.fallback_text.clone(),
                    model: model.to_string(),
                    prompt_tokens: Some(10),
                    completion_tokens: Some(20),
                }),
            }
        }

        async fn list_models(&self) -> Result<Vec<String>, BackendError> {
            Ok(vec!["llama3:latest".to_string()])
        }

        async fn health(&self) -> bool {
            true
        }
    }

    async fn pipeline_with(backend: Arc<StubBackend>) -> Arc<RequestPipeline> {
        let store = Arc::new(MemoryCache::new(1000, 100));
        let fingerprinter = Fingerprinter::new(1);
        let cache = Arc::new(ResponseCache::new(
            store,
            fingerprinter.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(30),
        ));
        let router = Arc::new(ModelRouter::new(
            Arc::clone(&backend) as Arc<dyn BackendClient>,
            &RouterConfig::default(),
        ));
        router.refresh().await;

        Arc::new(RequestPipeline::new(
            fingerprinter,
            cache,
            backend,
            router,
            PromptAssembler::new(8000),
            LimitsConfig::default(),
        ))
    }

    fn request(prompt: &str, policy: CachePolicy) -> GenerationRequest {
        GenerationRequest {
            model: "llama3".to_string(),
            prompt: prompt.to_string(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            stop: Vec::new(),
            seed: None,
            agent_profile: None,
            cache_policy: policy,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn identical_request_hits_cache_without_second_backend_call() {
        let backend = StubBackend::succeeding("hi there");
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        let first = pipeline
            .execute(request("hello", CachePolicy::Use))
            .await
            .unwrap();
        assert_eq!(first.cache_status, CacheStatus::Miss);
        assert_eq!(first.response, "hi there");

        let second = pipeline
            .execute(request("hello", CachePolicy::Use))
            .await
            .unwrap();
        assert_eq!(second.cache_status, CacheStatus::Hit);
        assert_eq!(second.response, "hi there");
        assert_eq!(second.tokens.prompt, Some(10));

        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_coalesce() {
        let backend = StubBackend::with_delay("shared", Duration::from_millis(200));
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(
                    async move { pipeline.execute(request("same", CachePolicy::Use)).await },
                )
            })
            .collect();

        let responses: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(backend.call_count(), 1, "backend called once for 50 clients");
        assert!(responses.iter().all(|r| r.response == "shared"));
    }

    #[tokio::test]
    async fn personality_difference_splits_cache_entries() {
        let backend = StubBackend::succeeding("persona reply");
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        let mut base = request("hello", CachePolicy::Use);
        base.agent_profile = Some(crate::api_types::AgentProfile {
            agent_id: 1,
            name: "Ada".to_string(),
            age: 30,
            occupation: "engineer".to_string(),
            personality: crate::api_types::PersonalityTraits {
                openness: Some(0.80),
                ..Default::default()
            },
            mental_state: Default::default(),
            context: None,
        });

        let mut variant = base.clone();
        variant.agent_profile.as_mut().unwrap().personality.openness = Some(0.81);

        pipeline.execute(base).await.unwrap();
        pipeline.execute(variant).await.unwrap();

        assert_eq!(
            backend.call_count(),
            2,
            "0.80 vs 0.81 openness must not share an entry"
        );
    }

    #[tokio::test]
    async fn refresh_ignores_hit_and_overwrites() {
        let backend =
            StubBackend::scripted(vec![Ok("first".to_string()), Ok("second".to_string())]);
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        pipeline
            .execute(request("hello", CachePolicy::Use))
            .await
            .unwrap();

        let refreshed = pipeline
            .execute(request("hello", CachePolicy::Refresh))
            .await
            .unwrap();
        assert_eq!(refreshed.cache_status, CacheStatus::Refresh);
        assert_eq!(refreshed.response, "second");
        assert_eq!(backend.call_count(), 2);

        // A later `use` request reads the refreshed bytes.
        let after = pipeline
            .execute(request("hello", CachePolicy::Use))
            .await
            .unwrap();
        assert_eq!(after.cache_status, CacheStatus::Hit);
        assert_eq!(after.response, "second");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn bypass_neither_reads_nor_writes() {
        let backend = StubBackend::scripted(vec![
            Ok("cached".to_string()),
            Ok("bypass one".to_string()),
            Ok("bypass two".to_string()),
        ]);
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        pipeline
            .execute(request("hello", CachePolicy::Use))
            .await
            .unwrap();

        // Bypass ignores the existing entry...
        let bypassed = pipeline
            .execute(request("hello", CachePolicy::Bypass))
            .await
            .unwrap();
        assert_eq!(bypassed.cache_status, CacheStatus::Bypass);
        assert_eq!(bypassed.response, "bypass one");

        // ...and does not replace it either.
        let hit = pipeline
            .execute(request("hello", CachePolicy::Use))
            .await
            .unwrap();
        assert_eq!(hit.cache_status, CacheStatus::Hit);
        assert_eq!(hit.response, "cached");
    }

    #[tokio::test]
    async fn rejection_is_negative_cached() {
        let backend = StubBackend::scripted(vec![Err(BackendError::Rejected {
            status: 422,
            message: "prompt rejected".to_string(),
        })]);
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        let first = pipeline.execute(request("bad", CachePolicy::Use)).await;
        assert!(matches!(
            first,
            Err(GatewayError::BackendRejected { status: 422, .. })
        ));

        // The second request is answered from the negative entry.
        let second = pipeline.execute(request("bad", CachePolicy::Use)).await;
        assert!(matches!(
            second,
            Err(GatewayError::BackendRejected { status: 422, .. })
        ));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_not_cached() {
        let backend = StubBackend::scripted(vec![
            Err(BackendError::Transient("connection reset".to_string())),
            Ok("recovered".to_string()),
        ]);
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        let first = pipeline.execute(request("hello", CachePolicy::Use)).await;
        assert!(matches!(first, Err(GatewayError::BackendError(_))));

        // The transient failure also gated the model; bring it back the way
        // the refresh loop would.
        pipeline.router().refresh().await;

        let second = pipeline
            .execute(request("hello", CachePolicy::Use))
            .await
            .unwrap();
        assert_eq!(second.response, "recovered");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn transient_failure_gates_the_model() {
        let backend = StubBackend::scripted(vec![Err(BackendError::Transient(
            "connection refused".to_string(),
        ))]);
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        let _ = pipeline.execute(request("hello", CachePolicy::Use)).await;

        // Until the next refresh the model fails fast with no backend call.
        let gated = pipeline.execute(request("other", CachePolicy::Use)).await;
        assert!(matches!(gated, Err(GatewayError::ModelUnavailable { .. })));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn unknown_model_issues_no_backend_call() {
        let backend = StubBackend::succeeding("never");
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        let mut req = request("hello", CachePolicy::Use);
        req.model = "ghost".to_string();

        let result = pipeline.execute(req).await;
        assert!(matches!(
            result,
            Err(GatewayError::ModelUnavailable { model }) if model == "ghost"
        ));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn max_tokens_ceiling_enforced() {
        let backend = StubBackend::succeeding("never");
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        let mut req = request("hello", CachePolicy::Use);
        req.max_tokens = Some(1_000_000);

        assert!(matches!(
            pipeline.execute(req).await,
            Err(GatewayError::Validation(_))
        ));
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn request_id_round_trips_without_affecting_cache() {
        let backend = StubBackend::succeeding("hi");
        let pipeline = pipeline_with(Arc::clone(&backend)).await;

        let mut first = request("hello", CachePolicy::Use);
        first.request_id = Some("alpha".to_string());
        let mut second = request("hello", CachePolicy::Use);
        second.request_id = Some("beta".to_string());

        let a = pipeline.execute(first).await.unwrap();
        let b = pipeline.execute(second).await.unwrap();

        assert_eq!(a.request_id.as_deref(), Some("alpha"));
        assert_eq!(b.request_id.as_deref(), Some("beta"));
        assert_eq!(b.cache_status, CacheStatus::Hit);
        assert_eq!(backend.call_count(), 1);
    }
}
