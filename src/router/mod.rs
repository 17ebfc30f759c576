//! Model routing.
//!
//! The router keeps a periodically refreshed snapshot of the models the
//! backend serves and maps logical model names onto backend identifiers.
//! Resolution order: exact match, match after stripping the `:` tag suffix
//! from backend names, then the configured alias table. A model that fails
//! to resolve, or whose health is marked unavailable, fails the request
//! fast. The pipeline never retries resolution; the router repairs itself
//! on its own schedule.
//!
//! Snapshots are immutable and swapped wholesale, so readers always observe
//! a consistent model list without holding a lock across any I/O.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    backend::BackendClient,
    config::RouterConfig,
    error::GatewayError,
};

/// Health of one backend model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelHealth {
    Ready,
    /// Recently recovered; serves traffic, promoted to ready on the next
    /// clean refresh.
    Warming,
    /// Hard-failed since the last refresh. Fails fast until the backend
    /// lists it again.
    Unavailable,
}

impl ModelHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Warming => "warming",
            Self::Unavailable => "unavailable",
        }
    }

    fn admits_traffic(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }
}

/// One known backend model.
#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub backend_name: String,
    pub health: ModelHealth,
}

/// Immutable view of the backend's model list.
#[derive(Debug, Default)]
pub struct ModelSnapshot {
    /// Keyed by backend model name, e.g. `llama3:latest`.
    pub models: HashMap<String, ModelRecord>,
    pub refreshed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub backend_name: String,
}

pub struct ModelRouter {
    backend: Arc<dyn BackendClient>,
    aliases: HashMap<String, String>,
    snapshot: RwLock<Arc<ModelSnapshot>>,
}

impl ModelRouter {
    pub fn new(backend: Arc<dyn BackendClient>, config: &RouterConfig) -> Self {
        Self {
            backend,
            aliases: config.aliases.clone(),
            snapshot: RwLock::new(Arc::new(ModelSnapshot::default())),
        }
    }

    /// Current snapshot; cheap to take, safe to hold.
    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        Arc::clone(&self.snapshot.read().expect("router snapshot lock"))
    }

    fn swap_snapshot(&self, next: ModelSnapshot) {
        *self.snapshot.write().expect("router snapshot lock") = Arc::new(next);
    }

    /// Map a logical model name to a backend identifier, health-gated.
    pub fn resolve(&self, logical: &str) -> Result<ResolvedModel, GatewayError> {
        let snapshot = self.snapshot();

        let record = lookup(&snapshot, logical).or_else(|| {
            self.aliases
                .get(logical)
                .and_then(|target| lookup(&snapshot, target))
        });

        match record {
            Some(record) if record.health.admits_traffic() => Ok(ResolvedModel {
                backend_name: record.backend_name.clone(),
            }),
            Some(record) => {
                tracing::debug!(
                    model = %logical,
                    backend_name = %record.backend_name,
                    health = record.health.as_str(),
                    "Model health-gated"
                );
                Err(GatewayError::ModelUnavailable {
                    model: logical.to_string(),
                })
            }
            None => Err(GatewayError::ModelUnavailable {
                model: logical.to_string(),
            }),
        }
    }

    /// Whether at least one model currently admits traffic. Readiness gates
    /// on this.
    pub fn any_model_available(&self) -> bool {
        self.snapshot()
            .models
            .values()
            .any(|record| record.health.admits_traffic())
    }

    /// Pull the model list from the backend and swap in a fresh snapshot.
    ///
    /// Models that were unavailable and are still listed re-enter through
    /// one warming cycle. A failed listing keeps the previous snapshot; a
    /// stale view beats an empty one.
    pub async fn refresh(&self) {
        let names = match self.backend.list_models().await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "Model list refresh failed, keeping previous snapshot");
                return;
            }
        };

        let previous = self.snapshot();
        let mut models = HashMap::with_capacity(names.len());
        for name in names {
            let health = match previous.models.get(&name).map(|r| r.health) {
                Some(ModelHealth::Unavailable) => ModelHealth::Warming,
                Some(ModelHealth::Warming) | Some(ModelHealth::Ready) | None => ModelHealth::Ready,
            };
            models.insert(
                name.clone(),
                ModelRecord {
                    backend_name: name,
                    health,
                },
            );
        }

        tracing::debug!(model_count = models.len(), "Model snapshot refreshed");
        self.swap_snapshot(ModelSnapshot {
            models,
            refreshed_at: Some(chrono::Utc::now()),
        });
    }

    /// Mark a model unavailable after a hard backend failure. It stays
    /// gated until a later refresh lists it again.
    pub fn mark_unavailable(&self, backend_name: &str) {
        let current = self.snapshot();
        if !current.models.contains_key(backend_name) {
            return;
        }

        let mut models = current.models.clone();
        if let Some(record) = models.get_mut(backend_name) {
            record.health = ModelHealth::Unavailable;
        }
        tracing::warn!(model = %backend_name, "Model marked unavailable after hard failure");
        self.swap_snapshot(ModelSnapshot {
            models,
            refreshed_at: current.refreshed_at,
        });
    }

    /// Periodic refresh loop; runs until cancelled.
    pub async fn run_refresh_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                _ = cancel.cancelled() => {
                    tracing::debug!("Model refresh loop stopped");
                    return;
                }
            }
        }
    }
}

fn lookup<'a>(snapshot: &'a ModelSnapshot, name: &str) -> Option<&'a ModelRecord> {
    if let Some(record) = snapshot.models.get(name) {
        return Some(record);
    }

    // Backend names carry tag suffixes (`llama3:latest`, `mistral:7b-q4`);
    // a logical name matches the untagged prefix. Ties break toward the
    // lexicographically smallest backend name for determinism.
    snapshot
        .models
        .values()
        .filter(|record| {
            record
                .backend_name
                .split_once(':')
                .is_some_and(|(base, _)| base == name)
        })
        .min_by(|a, b| a.backend_name.cmp(&b.backend_name))
}
