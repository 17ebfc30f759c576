//! Request and response payload types for the gateway API.
//!
//! `GenerationRequest` is immutable after admission. Decoding controls are
//! optional on the wire; their effective (post-default) values are what the
//! fingerprinter and the backend see, so the defaults live here next to the
//! fields they fill.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ErrorResponse;

/// Server-side default decoding controls, applied when the client omits them.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 200;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_REPEAT_PENALTY: f64 = 1.1;

/// Cache interaction policy for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Read from the cache and write successful responses back.
    #[default]
    Use,
    /// Never read from nor write to the cache.
    Bypass,
    /// Ignore hits, recompute, and overwrite the entry.
    Refresh,
}

/// A single generation request as admitted by the API surface.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GenerationRequest {
    /// Logical model name, resolved by the router.
    #[validate(length(min = 1, max = 256))]
    pub model: String,

    /// User prompt. Must be non-empty; the upper bound is enforced against
    /// the configured `max_prompt_chars` at admission.
    #[validate(length(min = 1))]
    pub prompt: String,

    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: Option<f64>,

    /// Bounded by the configured server ceiling at admission.
    #[validate(range(min = 1))]
    pub max_tokens: Option<u32>,

    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: Option<f64>,

    #[validate(range(min = 1))]
    pub top_k: Option<u32>,

    #[validate(range(min = 0.0, max = 10.0))]
    pub repeat_penalty: Option<f64>,

    /// Ordered stop strings. Order matters for the fingerprint.
    #[serde(default)]
    #[validate(custom(function = "validate_stop"))]
    pub stop: Vec<String>,

    /// Forwarded to the backend and part of the fingerprint when present.
    pub seed: Option<i64>,

    #[validate(nested)]
    pub agent_profile: Option<AgentProfile>,

    #[serde(default)]
    pub cache_policy: CachePolicy,

    /// Opaque client correlation id. Echoed back, excluded from the
    /// fingerprint.
    #[validate(length(max = 128))]
    pub request_id: Option<String>,
}

impl GenerationRequest {
    pub fn effective_temperature(&self) -> f64 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn effective_max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn effective_top_p(&self) -> f64 {
        self.top_p.unwrap_or(DEFAULT_TOP_P)
    }

    pub fn effective_top_k(&self) -> u32 {
        self.top_k.unwrap_or(DEFAULT_TOP_K)
    }

    pub fn effective_repeat_penalty(&self) -> f64 {
        self.repeat_penalty.unwrap_or(DEFAULT_REPEAT_PENALTY)
    }
}

fn validate_stop(stop: &[String]) -> Result<(), validator::ValidationError> {
    if stop.len() > 8 {
        return Err(validator::ValidationError::new("too_many_stop_strings"));
    }
    if stop.iter().any(|s| s.is_empty() || s.len() > 64) {
        return Err(validator::ValidationError::new("stop_string_length"));
    }
    Ok(())
}

/// Optional description of the speaking agent.
///
/// Personality and mental-state fields distinguish *absent* from any numeric
/// value: an omitted trait contributes nothing to the fingerprint and never
/// appears in the assembled prompt. Unknown keys in the incoming JSON are
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AgentProfile {
    pub agent_id: i64,

    #[validate(length(min = 1, max = 128))]
    pub name: String,

    pub age: u32,

    #[validate(length(max = 128))]
    pub occupation: String,

    #[serde(default)]
    #[validate(nested)]
    pub personality: PersonalityTraits,

    #[serde(default)]
    #[validate(nested)]
    pub mental_state: MentalState,

    /// Free-text situation description. The upper bound is enforced against
    /// the configured limit at admission; truncation happens later, in
    /// prompt assembly.
    pub context: Option<String>,
}

/// Big Five trait scores in [0, 1]. Absence is meaningful: no trait
/// defaults to 0.5.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct PersonalityTraits {
    #[validate(range(min = 0.0, max = 1.0))]
    pub openness: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub conscientiousness: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub extraversion: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub agreeableness: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub neuroticism: Option<f64>,
}

impl PersonalityTraits {
    /// Fixed trait order used by both the fingerprint and prompt assembly.
    pub fn entries(&self) -> [(&'static str, Option<f64>); 5] {
        [
            ("openness", self.openness),
            ("conscientiousness", self.conscientiousness),
            ("extraversion", self.extraversion),
            ("agreeableness", self.agreeableness),
            ("neuroticism", self.neuroticism),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.entries().iter().all(|(_, v)| v.is_none())
    }
}

/// Transient mental-state fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct MentalState {
    #[validate(range(min = 0.0, max = 1.0))]
    pub stress_level: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub life_satisfaction: Option<f64>,
    #[validate(length(min = 1, max = 64))]
    pub current_emotion: Option<String>,
}

impl MentalState {
    pub fn is_empty(&self) -> bool {
        self.stress_level.is_none()
            && self.life_satisfaction.is_none()
            && self.current_emotion.is_none()
    }
}

/// How the response was produced relative to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    Refresh,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Refresh => "refresh",
            Self::Bypass => "bypass",
        }
    }
}

/// Token accounting as reported by the backend. Members are null when the
/// backend omits counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: Option<u64>,
    pub completion: Option<u64>,
}

/// Successful generation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
    /// Backend-reported model identifier.
    pub model: String,
    pub cache_status: CacheStatus,
    pub latency_ms: u64,
    pub tokens: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchGenerateRequest {
    pub requests: Vec<GenerationRequest>,
}

/// Per-slot outcome of a batch. Order always matches the input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchOutcome {
    Success(GenerateResponse),
    Failure(ErrorResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchGenerateResponse {
    pub responses: Vec<BatchOutcome>,
}

/// One row of `GET /models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub backend_name: String,
    pub health: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}
