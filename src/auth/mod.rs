//! Admission: API-key validation and quota enrollment.
//!
//! Keys come from configuration; there is no persistent identity store. A
//! validated request is tagged with its [`QuotaIdentity`], the configured
//! key name, which is what the rate limiter buckets on.

use subtle::ConstantTimeEq;

use crate::config::AuthConfig;

/// Built-in development key, honored only with `auth.allow_dev_key`.
const DEV_KEY: &str = "dev-key";
const DEV_IDENTITY: &str = "dev";

/// The quota identity a request runs under after admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaIdentity(pub String);

impl QuotaIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Validates presented API keys against the configured set.
pub struct Admission {
    keys: Vec<(String, String)>,
    allow_dev_key: bool,
}

impl Admission {
    pub fn new(config: &AuthConfig) -> Self {
        if config.allow_dev_key {
            tracing::warn!(
                "auth.allow_dev_key is enabled; the built-in development key is accepted. \
                 Do not run this configuration outside local development."
            );
        }

        Self {
            keys: config
                .api_keys
                .iter()
                .map(|k| (k.key.clone(), k.name.clone()))
                .collect(),
            allow_dev_key: config.allow_dev_key,
        }
    }

    /// Validate a presented key. Comparison is constant-time per candidate
    /// so timing does not leak key prefixes.
    pub fn authenticate(&self, presented: &str) -> Option<QuotaIdentity> {
        for (key, name) in &self.keys {
            if constant_time_eq(key.as_bytes(), presented.as_bytes()) {
                return Some(QuotaIdentity(name.clone()));
            }
        }

        if self.allow_dev_key && constant_time_eq(DEV_KEY.as_bytes(), presented.as_bytes()) {
            return Some(QuotaIdentity(DEV_IDENTITY.to_string()));
        }

        None
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}
