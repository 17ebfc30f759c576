//! Request fingerprinting.
//!
//! A fingerprint is a SHA-256 digest over a canonical byte serialization of
//! every generation-affecting field of a request, with defaults filled in
//! first. Two semantically identical requests always hash to the same value;
//! any field that changes what the backend would generate changes the digest.
//! `request_id` and `cache_policy` are excluded.
//!
//! The serialization is versioned: the schema-version byte comes first, so
//! bumping `cache.schema_version` in config makes every existing cache entry
//! unreachable at once.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::api_types::{AgentProfile, GenerationRequest};

/// Reals are quantized to six decimal places before hashing so float
/// formatting or representation drift cannot split the cache key space.
const QUANTUM: f64 = 1e6;

/// 256-bit request digest; the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Computes fingerprints for a fixed schema version.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    schema_version: u8,
}

impl Fingerprinter {
    pub fn new(schema_version: u8) -> Self {
        Self { schema_version }
    }

    pub fn schema_version(&self) -> u8 {
        self.schema_version
    }

    /// Digest a request's generation-affecting fields.
    pub fn fingerprint(&self, request: &GenerationRequest) -> Fingerprint {
        let mut canon = Canonicalizer::new();
        canon.byte(self.schema_version);
        canon.str_field(&request.model);
        canon.str_field(&request.prompt);
        canon.real(request.effective_temperature());
        canon.uint(u64::from(request.effective_max_tokens()));
        canon.real(request.effective_top_p());
        canon.uint(u64::from(request.effective_top_k()));
        canon.real(request.effective_repeat_penalty());

        canon.uint(request.stop.len() as u64);
        for stop in &request.stop {
            canon.str_field(stop);
        }

        canon.opt_int(request.seed);

        match &request.agent_profile {
            Some(profile) => {
                canon.byte(1);
                canon.profile(profile);
            }
            None => canon.byte(0),
        }

        Fingerprint(canon.finish())
    }

    /// Cache key for a fingerprint: `gw:resp:v{schema}:{hex}`.
    pub fn cache_key(&self, fp: &Fingerprint) -> String {
        format!("gw:resp:v{}:{}", self.schema_version, fp.to_hex())
    }
}

/// Incremental canonical encoder. Strings are length-prefixed, optionals
/// carry an explicit presence byte, and every real passes through the
/// quantizer, so no two distinct field sequences can collide structurally.
struct Canonicalizer {
    hasher: Sha256,
}

impl Canonicalizer {
    fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    fn byte(&mut self, b: u8) {
        self.hasher.update([b]);
    }

    fn str_field(&mut self, s: &str) {
        self.hasher.update((s.len() as u64).to_le_bytes());
        self.hasher.update(s.as_bytes());
    }

    fn uint(&mut self, v: u64) {
        self.hasher.update(v.to_le_bytes());
    }

    fn real(&mut self, v: f64) {
        let quantized = (v * QUANTUM).round() as i64;
        self.hasher.update(quantized.to_le_bytes());
    }

    fn opt_int(&mut self, v: Option<i64>) {
        match v {
            Some(v) => {
                self.byte(1);
                self.hasher.update(v.to_le_bytes());
            }
            None => self.byte(0),
        }
    }

    fn opt_real(&mut self, v: Option<f64>) {
        match v {
            Some(v) => {
                self.byte(1);
                self.real(v);
            }
            None => self.byte(0),
        }
    }

    fn opt_str(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.byte(1);
                self.str_field(s);
            }
            None => self.byte(0),
        }
    }

    fn profile(&mut self, profile: &AgentProfile) {
        self.hasher.update(profile.agent_id.to_le_bytes());
        self.str_field(&profile.name);
        self.uint(u64::from(profile.age));
        self.str_field(&profile.occupation);

        // Traits in their fixed enumeration order; absence is encoded, not
        // defaulted, so "no openness" and "openness 0.5" differ.
        for (_, value) in profile.personality.entries() {
            self.opt_real(value);
        }

        self.opt_real(profile.mental_state.stress_level);
        self.opt_real(profile.mental_state.life_satisfaction);
        self.opt_str(profile.mental_state.current_emotion.as_deref());

        self.opt_str(profile.context.as_deref());
    }

    fn finish(self) -> [u8; 32] {
        self.hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_types::{CachePolicy, MentalState, PersonalityTraits};

    fn request(model: &str, prompt: &str) -> GenerationRequest {
        GenerationRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            stop: Vec::new(),
            seed: None,
            agent_profile: None,
            cache_policy: CachePolicy::Use,
            request_id: None,
        }
    }

    fn profile() -> AgentProfile {
        AgentProfile {
            agent_id: 42,
            name: "Mira".to_string(),
            age: 29,
            occupation: "cartographer".to_string(),
            personality: PersonalityTraits {
                openness: Some(0.80),
                ..Default::default()
            },
            mental_state: MentalState::default(),
            context: None,
        }
    }

    #[test]
    fn deterministic_across_calls() {
        let fp = Fingerprinter::new(1);
        let req = request("llama3", "hello");
        assert_eq!(fp.fingerprint(&req), fp.fingerprint(&req));
    }

    #[test]
    fn request_id_and_cache_policy_excluded() {
        let fp = Fingerprinter::new(1);
        let base = request("llama3", "hello");

        let mut with_id = base.clone();
        with_id.request_id = Some("corr-123".to_string());
        with_id.cache_policy = CachePolicy::Refresh;

        assert_eq!(fp.fingerprint(&base), fp.fingerprint(&with_id));
    }

    #[test]
    fn explicit_default_equals_omitted() {
        let fp = Fingerprinter::new(1);
        let omitted = request("llama3", "hello");
        let mut explicit = omitted.clone();
        explicit.temperature = Some(crate::api_types::DEFAULT_TEMPERATURE);
        explicit.max_tokens = Some(crate::api_types::DEFAULT_MAX_TOKENS);

        assert_eq!(fp.fingerprint(&omitted), fp.fingerprint(&explicit));
    }

    #[test]
    fn generation_affecting_fields_change_digest() {
        let fp = Fingerprinter::new(1);
        let base = request("llama3", "hello");
        let base_fp = fp.fingerprint(&base);

        let mut seed = base.clone();
        seed.seed = Some(7);
        assert_ne!(base_fp, fp.fingerprint(&seed));

        let mut stop = base.clone();
        stop.stop = vec!["\n".to_string()];
        assert_ne!(base_fp, fp.fingerprint(&stop));

        let mut max_tokens = base.clone();
        max_tokens.max_tokens = Some(201);
        assert_ne!(base_fp, fp.fingerprint(&max_tokens));

        let mut model = base.clone();
        model.model = "llama3:8b".to_string();
        assert_ne!(base_fp, fp.fingerprint(&model));
    }

    #[test]
    fn stop_order_matters() {
        let fp = Fingerprinter::new(1);
        let mut a = request("m", "p");
        a.stop = vec!["x".to_string(), "y".to_string()];
        let mut b = a.clone();
        b.stop.reverse();
        assert_ne!(fp.fingerprint(&a), fp.fingerprint(&b));
    }

    #[test]
    fn personality_sensitive_at_quantization_limit() {
        // 0.80 vs 0.81 differ well above the 1e-6 quantum and must split.
        let fp = Fingerprinter::new(1);
        let mut a = request("m", "p");
        a.agent_profile = Some(profile());
        let mut b = a.clone();
        b.agent_profile.as_mut().unwrap().personality.openness = Some(0.81);
        assert_ne!(fp.fingerprint(&a), fp.fingerprint(&b));
    }

    #[test]
    fn quantization_absorbs_representation_noise() {
        let fp = Fingerprinter::new(1);
        let mut a = request("m", "p");
        a.agent_profile = Some(profile());
        let mut b = a.clone();
        // Differs only below the sixth decimal place.
        b.agent_profile.as_mut().unwrap().personality.openness = Some(0.80 + 1e-9);
        assert_eq!(fp.fingerprint(&a), fp.fingerprint(&b));
    }

    #[test]
    fn absent_trait_differs_from_midpoint() {
        let fp = Fingerprinter::new(1);
        let mut absent = request("m", "p");
        let mut p = profile();
        p.personality.openness = None;
        absent.agent_profile = Some(p);

        let mut midpoint = absent.clone();
        midpoint.agent_profile.as_mut().unwrap().personality.openness = Some(0.5);

        assert_ne!(fp.fingerprint(&absent), fp.fingerprint(&midpoint));
    }

    #[test]
    fn profile_presence_changes_digest() {
        let fp = Fingerprinter::new(1);
        let bare = request("m", "p");
        let mut with_profile = bare.clone();
        with_profile.agent_profile = Some(profile());
        assert_ne!(fp.fingerprint(&bare), fp.fingerprint(&with_profile));
    }

    #[test]
    fn schema_version_partitions_keys() {
        let req = request("m", "p");
        let v1 = Fingerprinter::new(1);
        let v2 = Fingerprinter::new(2);
        assert_ne!(v1.fingerprint(&req), v2.fingerprint(&req));
        assert!(v1.cache_key(&v1.fingerprint(&req)).starts_with("gw:resp:v1:"));
        assert!(v2.cache_key(&v2.fingerprint(&req)).starts_with("gw:resp:v2:"));
    }
}
