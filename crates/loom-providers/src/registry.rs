use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use loom_core::types::{ComplexityLevel, ProviderConfig, ProviderStatus, ProviderType};

use crate::protocol::{ChatRequest, ChatResponse, LlmProtocol, MockProtocol, OpenAiCompatProtocol, ProtocolError};
use crate::scorer::{composite_score, is_tied_with_top, ScorerWeights};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("provider not found: `{0}`")]
    ProviderNotFound(String),
    #[error("provider is disabled: `{0}`")]
    ProviderDisabled(String),
    #[error("no eligible models at provider `{0}`")]
    NoModelsAvailable(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ---------------------------------------------------------------------------
// Inner state — one lock covers the map, the weights, and the counter, so
// scores observed from list_active are consistent with their inputs.
// ---------------------------------------------------------------------------

struct Entry {
    config: ProviderConfig,
    protocol: Arc<dyn LlmProtocol>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    weights: ScorerWeights,
    rr_counter: u64,
}

/// Request-latency EMA smoothing factor.
const EMA_ALPHA: f64 = 0.2;

// ---------------------------------------------------------------------------
// ProviderRegistry
// ---------------------------------------------------------------------------

/// Holds provider configs and protocol handles; ranks candidates by
/// composite score with round-robin across ties, and fronts chat-completion
/// calls with model-not-found recovery.
pub struct ProviderRegistry {
    inner: RwLock<Inner>,
}

impl ProviderRegistry {
    pub fn new(weights: ScorerWeights) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                weights,
                rr_counter: 0,
            }),
        }
    }

    /// Register or update a provider, selecting a protocol handle from its
    /// type. Mock providers get a fresh scripted protocol; everything else
    /// speaks the openai-compatible surface.
    pub async fn register(&self, config: ProviderConfig) {
        let protocol: Arc<dyn LlmProtocol> = match config.provider_type {
            ProviderType::Mock => Arc::new(MockProtocol::new()),
            _ => Arc::new(OpenAiCompatProtocol::new(
                config.endpoint.clone(),
                config.api_key.clone(),
            )),
        };
        self.register_with_protocol(config, protocol).await;
    }

    /// Register or update a provider with an explicit protocol handle.
    pub async fn register_with_protocol(
        &self,
        mut config: ProviderConfig,
        protocol: Arc<dyn LlmProtocol>,
    ) {
        let mut inner = self.inner.write().await;
        config.score = composite_score(&config, &inner.weights);
        debug!(provider_id = %config.id, provider_type = ?config.provider_type, "provider registered");
        inner.entries.insert(config.id.clone(), Entry { config, protocol });
    }

    /// Remove a provider. Returns its config when it existed.
    pub async fn unregister(&self, id: &str) -> Option<ProviderConfig> {
        let mut inner = self.inner.write().await;
        inner.entries.remove(id).map(|e| e.config)
    }

    pub async fn get(&self, id: &str) -> Option<ProviderConfig> {
        let inner = self.inner.read().await;
        inner.entries.get(id).map(|e| e.config.clone())
    }

    pub async fn list_all(&self) -> Vec<ProviderConfig> {
        let inner = self.inner.read().await;
        let mut out: Vec<ProviderConfig> = inner.entries.values().map(|e| e.config.clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Replace the scorer weights. Applies to subsequent computations only;
    /// already-stored scores are not rewritten.
    pub async fn set_weights(&self, weights: ScorerWeights) {
        let mut inner = self.inner.write().await;
        inner.weights = weights;
    }

    // -----------------------------------------------------------------------
    // Ranked listings
    // -----------------------------------------------------------------------

    /// Servable providers sorted by composite score, ties rotated
    /// round-robin so tied providers share traffic evenly over time.
    pub async fn list_active(&self) -> Vec<ProviderConfig> {
        let mut inner = self.inner.write().await;
        let mut active: Vec<ProviderConfig> = inner
            .entries
            .values()
            .filter(|e| e.config.status.is_servable())
            .map(|e| e.config.clone())
            .collect();
        Self::sort_by_score(&mut active);
        rotate_tie_group(&mut active, inner.rr_counter);
        inner.rr_counter += 1;
        active
    }

    /// Servable providers ranked for a complexity level: providers whose
    /// model-size tier matches the level come first (score-sorted,
    /// tie-rotated), followed by the rest by score.
    pub async fn list_active_for_complexity(
        &self,
        complexity: ComplexityLevel,
    ) -> Vec<ProviderConfig> {
        let mut inner = self.inner.write().await;
        let (mut matched, mut rest): (Vec<ProviderConfig>, Vec<ProviderConfig>) = inner
            .entries
            .values()
            .filter(|e| e.config.status.is_servable())
            .map(|e| e.config.clone())
            .partition(|p| complexity.matches_size(p.model_size_b));

        Self::sort_by_score(&mut matched);
        Self::sort_by_score(&mut rest);
        rotate_tie_group(&mut matched, inner.rr_counter);
        inner.rr_counter += 1;

        matched.extend(rest);
        matched
    }

    fn sort_by_score(list: &mut [ProviderConfig]) {
        list.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    /// Record the outcome of one request against a provider: bumps the
    /// total/success counters, folds the latency into the request-latency
    /// EMA, and recomputes the composite score.
    pub async fn record_request_metrics(&self, id: &str, latency_ms: f64, success: bool) {
        let mut inner = self.inner.write().await;
        let weights = inner.weights;
        let Some(entry) = inner.entries.get_mut(id) else {
            warn!(provider_id = %id, "request metrics for unknown provider");
            return;
        };
        entry.config.total_requests += 1;
        if success {
            entry.config.successful_requests += 1;
        }
        entry.config.avg_request_latency_ms = if entry.config.avg_request_latency_ms <= 0.0 {
            latency_ms
        } else {
            EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * entry.config.avg_request_latency_ms
        };
        entry.config.score = composite_score(&entry.config, &weights);
    }

    /// Stamp a heartbeat probe result and recompute the score. Pending and
    /// unhealthy providers recover to healthy on a fresh stamp; disabled
    /// providers stay disabled.
    pub async fn update_heartbeat_latency(&self, id: &str, latency_ms: f64) {
        let mut inner = self.inner.write().await;
        let weights = inner.weights;
        let Some(entry) = inner.entries.get_mut(id) else {
            warn!(provider_id = %id, "heartbeat for unknown provider");
            return;
        };
        entry.config.last_heartbeat_at = Some(Utc::now());
        entry.config.heartbeat_latency_ms = latency_ms;
        if matches!(
            entry.config.status,
            ProviderStatus::Pending | ProviderStatus::Unhealthy
        ) {
            entry.config.status = ProviderStatus::Healthy;
        }
        entry.config.score = composite_score(&entry.config, &weights);
    }

    /// Mark healthy/active providers unhealthy when their heartbeat is older
    /// than `max_age`. Returns the ids that were demoted.
    pub async fn sweep_stale_heartbeats(&self, max_age: chrono::Duration) -> Vec<String> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut demoted = Vec::new();
        for entry in inner.entries.values_mut() {
            if !entry.config.status.is_servable() {
                continue;
            }
            let stale = match entry.config.last_heartbeat_at {
                Some(at) => now.signed_duration_since(at) > max_age,
                None => true,
            };
            if stale {
                entry.config.status = ProviderStatus::Unhealthy;
                demoted.push(entry.config.id.clone());
            }
        }
        if !demoted.is_empty() {
            info!(count = demoted.len(), "providers demoted on stale heartbeat");
        }
        demoted
    }

    // -----------------------------------------------------------------------
    // Chat completion façade
    // -----------------------------------------------------------------------

    /// Make a chat-completion call through the provider's protocol handle.
    ///
    /// The stored effective model overrides whatever the request carries.
    /// Model-not-found is the only auto-recovery: the provider's models list
    /// is queried and the call retried exactly once with the first available
    /// model, which becomes the new stored effective model. All other
    /// errors propagate. Metrics are recorded for every call, including both
    /// branches of the retry.
    pub async fn send_chat_completion(
        &self,
        id: &str,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        let (protocol, model) = {
            let inner = self.inner.read().await;
            let entry = inner
                .entries
                .get(id)
                .ok_or_else(|| RegistryError::ProviderNotFound(id.to_string()))?;
            if entry.config.status == ProviderStatus::Disabled {
                return Err(RegistryError::ProviderDisabled(id.to_string()));
            }
            (Arc::clone(&entry.protocol), entry.config.model.clone())
        };

        let effective = request.with_model(model);
        let first = self.timed_call(id, &protocol, &effective).await;

        let err = match first {
            Ok(resp) => return Ok(resp),
            Err(e) => e,
        };

        if !err.is_model_not_found() {
            return Err(err.into());
        }

        // The single auto-recovery path: adopt the first advertised model.
        let models = protocol.get_models().await?;
        let Some(fallback) = models.into_iter().next() else {
            return Err(RegistryError::NoModelsAvailable(id.to_string()));
        };
        info!(provider_id = %id, model = %fallback, "model not found; retrying with first available model");
        {
            let mut inner = self.inner.write().await;
            if let Some(entry) = inner.entries.get_mut(id) {
                entry.config.model = fallback.clone();
            }
        }

        let retried = effective.with_model(fallback);
        self.timed_call(id, &protocol, &retried).await.map_err(Into::into)
    }

    async fn timed_call(
        &self,
        id: &str,
        protocol: &Arc<dyn LlmProtocol>,
        request: &ChatRequest,
    ) -> std::result::Result<ChatResponse, ProtocolError> {
        let start = Instant::now();
        let result = protocol.create_chat_completion(request).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record_request_metrics(id, latency_ms, result.is_ok()).await;
        result
    }
}

/// Rotate the leading tie group of a score-sorted list by `counter` so tied
/// providers take turns at the front.
fn rotate_tie_group(list: &mut [ProviderConfig], counter: u64) {
    if list.len() < 2 {
        return;
    }
    let top = list[0].score;
    let ties = list.iter().take_while(|p| is_tied_with_top(top, p.score)).count();
    if ties > 1 {
        list[..ties].rotate_left((counter % ties as u64) as usize);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
