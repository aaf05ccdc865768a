//! Canary deployment router: weighted traffic split between an old and a
//! new pipeline version, reservoir-sampled latency percentiles, and a
//! staged auto-promote/rollback policy (spec.md §4.4).
//!
//! The `VersionMetrics`/status-machine shape is grounded in the teacher's
//! `dashflow::ab_testing` module (`Variant::traffic_allocation`,
//! `ABTest::min_samples`/`has_enough_samples`), generalized from a one-shot
//! statistical verdict to a multi-step staged rollout: `promotionSteps`
//! replaces the teacher's single traffic split, and `currentStep`/
//! `stepStartedAt` track progress through it. Reservoir sampling
//! (Algorithm R) isn't present in the pack; it's the standard fixed-memory
//! technique for streaming percentile estimation, applied here to bound
//! `VersionMetrics`' latency sample set at `MAX_SAMPLES` (SPEC_FULL.md
//! §4.4.S).

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::ConstellationError;

/// Reservoir sampling cap: bounds memory for latency percentile estimation
/// regardless of how many requests a version has served.
pub const MAX_SAMPLES: usize = 10_000;

/// Lifecycle state of a canary rollout (spec.md §4.4's state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CanaryStatus {
    Observing,
    Promoting,
    RolledBack,
    Complete,
}

/// Per-version request outcome and latency tracking, with a reservoir of at
/// most `MAX_SAMPLES` observed latencies used for percentile estimates.
#[derive(Debug, Default)]
pub struct VersionMetrics {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    samples: std::sync::Mutex<Vec<f64>>,
    latency_sum: std::sync::Mutex<f64>,
    seen: AtomicU64,
}

impl VersionMetrics {
    /// Record one request's outcome and latency (Algorithm R: the first
    /// `MAX_SAMPLES` observations fill the reservoir directly; afterwards
    /// each new observation replaces a uniformly random existing slot with
    /// probability `MAX_SAMPLES / seen_count`).
    pub fn record(&self, latency_ms: f64, success: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        *self.latency_sum.lock().unwrap_or_else(|e| e.into_inner()) += latency_ms;

        let seen = self.seen.fetch_add(1, Ordering::Relaxed) + 1;
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() < MAX_SAMPLES {
            samples.push(latency_ms);
        } else {
            let j = rand::thread_rng().gen_range(0..seen);
            if (j as usize) < MAX_SAMPLES {
                samples[j as usize] = latency_ms;
            }
        }
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.requests.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            self.failures.load(Ordering::Relaxed) as f64 / total as f64
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let total = self.requests.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            *self.latency_sum.lock().unwrap_or_else(|e| e.into_inner()) / total as f64
        }
    }

    pub fn percentile_latency_ms(&self, p: f64) -> f64 {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((samples.len() as f64 - 1.0) * p).round() as usize;
        samples[idx]
    }

    pub fn p99_latency_ms(&self) -> f64 {
        self.percentile_latency_ms(0.99)
    }

    pub fn snapshot(&self) -> VersionMetricsSnapshot {
        VersionMetricsSnapshot {
            requests: self.request_count(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            error_rate: self.error_rate(),
            avg_latency_ms: self.avg_latency_ms(),
            p99_latency_ms: self.p99_latency_ms(),
        }
    }
}

/// Serializable snapshot of [`VersionMetrics`], for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
}

/// Thresholds and staging plan governing a canary rollout (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct CanaryConfig {
    pub initial_weight: f64,
    /// Strictly ascending, last element must be `1.0`.
    pub promotion_steps: Vec<f64>,
    pub observation_window: Duration,
    pub error_threshold: f64,
    pub latency_threshold_ms: Option<f64>,
    pub min_requests: u64,
    pub auto_promote: bool,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            initial_weight: 0.05,
            promotion_steps: vec![0.25, 0.5, 0.75, 1.0],
            observation_window: Duration::from_secs(300),
            error_threshold: 0.05,
            latency_threshold_ms: None,
            min_requests: 100,
            auto_promote: true,
        }
    }
}

impl CanaryConfig {
    /// Validates the shape spec.md §4.4 requires: `initialWeight` in
    /// `[0.0, 1.0]`, `promotionSteps` non-empty, strictly ascending, and
    /// ending at `1.0`.
    pub fn validate(&self) -> Result<(), ConstellationError> {
        if !(0.0..=1.0).contains(&self.initial_weight) {
            return Err(ConstellationError::InvalidRequest("initialWeight must be within [0.0, 1.0]".to_string()));
        }
        if self.promotion_steps.is_empty() {
            return Err(ConstellationError::InvalidRequest("promotionSteps must be non-empty".to_string()));
        }
        if self.promotion_steps.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConstellationError::InvalidRequest("promotionSteps must be strictly ascending".to_string()));
        }
        if (self.promotion_steps.last().copied().unwrap_or(0.0) - 1.0).abs() > f64::EPSILON {
            return Err(ConstellationError::InvalidRequest("promotionSteps must end at 1.0".to_string()));
        }
        Ok(())
    }
}

/// One named pipeline's canary rollout state. Versions are addressed by the
/// `PipelineVersionStore`'s auto-incrementing version number; the HTTP
/// layer bridges that to structural hashes (see `api::routes::canary`).
pub struct CanaryState {
    pub pipeline_name: String,
    pub old_version: u64,
    pub new_version: u64,
    config: CanaryConfig,
    current_weight: RwLock<f64>,
    /// `None` until the first promotion step is taken (rollout is still
    /// running at `initialWeight`); `Some(i)` indexes `promotionSteps`.
    current_step: RwLock<Option<usize>>,
    status: RwLock<CanaryStatus>,
    started_at: chrono::DateTime<chrono::Utc>,
    step_started_at: RwLock<chrono::DateTime<chrono::Utc>>,
    pub old_metrics: VersionMetrics,
    pub new_metrics: VersionMetrics,
}

/// What happened as a result of recording one request's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanaryTransition {
    pub status: CanaryStatus,
    /// Set only on the transition into `Complete`: the version that should
    /// now become the pipeline's active version.
    pub newly_active_version: Option<u64>,
}

impl CanaryState {
    pub fn new(
        pipeline_name: impl Into<String>,
        old_version: u64,
        new_version: u64,
        config: CanaryConfig,
    ) -> Result<Self, ConstellationError> {
        config.validate()?;
        let now = chrono::Utc::now();
        Ok(Self {
            pipeline_name: pipeline_name.into(),
            old_version,
            new_version,
            current_weight: RwLock::new(config.initial_weight),
            current_step: RwLock::new(None),
            status: RwLock::new(CanaryStatus::Observing),
            started_at: now,
            step_started_at: RwLock::new(now),
            old_metrics: VersionMetrics::default(),
            new_metrics: VersionMetrics::default(),
            config,
        })
    }

    /// Weighted random pick of which version number should serve the next
    /// request.
    pub async fn select_version(&self) -> u64 {
        let weight = *self.current_weight.read().await;
        if rand::thread_rng().gen_bool(weight.clamp(0.0, 1.0)) {
            self.new_version
        } else {
            self.old_version
        }
    }

    /// Record one request's outcome against whichever version served it,
    /// then evaluate the promotion/rollback policy under this rollout's
    /// lock (spec.md §4.4 `recordResult`'s three-step check).
    pub async fn record_result(&self, version: u64, latency_ms: f64, success: bool) -> CanaryTransition {
        if version == self.new_version {
            self.new_metrics.record(latency_ms, success);
        } else {
            self.old_metrics.record(latency_ms, success);
        }

        let mut status = self.status.write().await;
        if !matches!(*status, CanaryStatus::Observing | CanaryStatus::Promoting) {
            return CanaryTransition { status: *status, newly_active_version: None };
        }

        // 1. Not enough samples on the new version yet: no transition.
        if self.new_metrics.request_count() < self.config.min_requests {
            return CanaryTransition { status: *status, newly_active_version: None };
        }

        // 2. Error or latency threshold breached: roll back.
        let latency_breach = self
            .config
            .latency_threshold_ms
            .is_some_and(|threshold| self.new_metrics.p99_latency_ms() > threshold);
        if self.new_metrics.error_rate() > self.config.error_threshold || latency_breach {
            *status = CanaryStatus::RolledBack;
            *self.current_weight.write().await = 0.0;
            return CanaryTransition { status: *status, newly_active_version: None };
        }

        // 3. Auto-promote once the observation window for the current step
        // has elapsed.
        if self.config.auto_promote {
            let step_started_at = *self.step_started_at.read().await;
            let elapsed = chrono::Utc::now().signed_duration_since(step_started_at);
            let window = chrono::Duration::from_std(self.config.observation_window).unwrap_or(chrono::Duration::zero());
            if elapsed >= window {
                return self.advance_step(&mut status).await;
            }
        }

        CanaryTransition { status: *status, newly_active_version: None }
    }

    /// Advances one promotion step, caller already holds `status`'s write
    /// guard. Shared by the auto-promote path and the manual `promote()`
    /// control (spec.md: "`promote(name)` advances one step, idempotent at
    /// last step").
    async fn advance_step(&self, status: &mut tokio::sync::RwLockWriteGuard<'_, CanaryStatus>) -> CanaryTransition {
        let mut step = self.current_step.write().await;
        let last_index = self.config.promotion_steps.len() - 1;
        match *step {
            Some(i) if i == last_index => {
                **status = CanaryStatus::Complete;
                *self.current_weight.write().await = 1.0;
                CanaryTransition { status: **status, newly_active_version: Some(self.new_version) }
            }
            Some(i) => {
                let next = i + 1;
                *step = Some(next);
                *self.current_weight.write().await = self.config.promotion_steps[next];
                *self.step_started_at.write().await = chrono::Utc::now();
                **status = CanaryStatus::Observing;
                CanaryTransition { status: **status, newly_active_version: None }
            }
            None => {
                *step = Some(0);
                *self.current_weight.write().await = self.config.promotion_steps[0];
                *self.step_started_at.write().await = chrono::Utc::now();
                **status = CanaryStatus::Observing;
                CanaryTransition { status: **status, newly_active_version: None }
            }
        }
    }

    /// Manual promotion control: advances one step regardless of
    /// `autoPromote`/`observationWindow`/`minRequests`. Idempotent once
    /// `Complete`.
    pub async fn promote(&self) -> CanaryTransition {
        let mut status = self.status.write().await;
        if *status == CanaryStatus::Complete || *status == CanaryStatus::RolledBack {
            return CanaryTransition { status: *status, newly_active_version: None };
        }
        self.advance_step(&mut status).await
    }

    /// Manual rollback/abort control.
    pub async fn rollback(&self) {
        *self.status.write().await = CanaryStatus::RolledBack;
        *self.current_weight.write().await = 0.0;
    }

    pub async fn snapshot(&self) -> CanaryStatusSnapshot {
        CanaryStatusSnapshot {
            pipeline_name: self.pipeline_name.clone(),
            old_version: self.old_version,
            new_version: self.new_version,
            current_weight: *self.current_weight.read().await,
            current_step: *self.current_step.read().await,
            status: *self.status.read().await,
            started_at: self.started_at,
            step_started_at: *self.step_started_at.read().await,
            old_metrics: self.old_metrics.snapshot(),
            new_metrics: self.new_metrics.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStatusSnapshot {
    pub pipeline_name: String,
    pub old_version: u64,
    pub new_version: u64,
    pub current_weight: f64,
    pub current_step: Option<usize>,
    pub status: CanaryStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub step_started_at: chrono::DateTime<chrono::Utc>,
    pub old_metrics: VersionMetricsSnapshot,
    pub new_metrics: VersionMetricsSnapshot,
}

/// Active canary rollouts, by pipeline name.
pub struct CanaryRouter {
    rollouts: RwLock<HashMap<String, std::sync::Arc<CanaryState>>>,
    config: CanaryConfig,
}

impl CanaryRouter {
    pub fn new(config: CanaryConfig) -> Self {
        Self { rollouts: RwLock::new(HashMap::new()), config }
    }

    /// Begin a canary rollout using the router's default config. If
    /// `old_version` is `None` (no prior active version for this pipeline
    /// — see DESIGN.md Open Question decision), version 1 is synthesized
    /// as the baseline.
    pub async fn start(
        &self,
        pipeline_name: &str,
        old_version: Option<u64>,
        new_version: u64,
    ) -> Result<std::sync::Arc<CanaryState>, ConstellationError> {
        self.start_with_config(pipeline_name, old_version, new_version, self.config.clone()).await
    }

    /// Like [`start`](Self::start), but with a caller-supplied config
    /// instead of the router's default — used by the HTTP
    /// `/deploy/canary` route, which accepts a per-rollout threshold
    /// override.
    pub async fn start_with_config(
        &self,
        pipeline_name: &str,
        old_version: Option<u64>,
        new_version: u64,
        config: CanaryConfig,
    ) -> Result<std::sync::Arc<CanaryState>, ConstellationError> {
        let old = old_version.unwrap_or(1);
        let state = std::sync::Arc::new(CanaryState::new(pipeline_name, old, new_version, config)?);
        self.rollouts.write().await.insert(pipeline_name.to_string(), state.clone());
        Ok(state)
    }

    /// Returns the version number that should serve the next request for
    /// `pipeline_name`, or `None` if no canary is running (caller should
    /// fall back to the pipeline's active version).
    pub async fn select_version(&self, pipeline_name: &str) -> Option<u64> {
        let rollout = self.rollouts.read().await.get(pipeline_name)?.clone();
        Some(rollout.select_version().await)
    }

    /// Records one request's outcome against `pipeline_name`'s rollout (a
    /// no-op, returning `None`, if no canary is running).
    pub async fn record_result(
        &self,
        pipeline_name: &str,
        version: u64,
        latency_ms: f64,
        success: bool,
    ) -> Option<CanaryTransition> {
        let rollout = self.rollouts.read().await.get(pipeline_name)?.clone();
        Some(rollout.record_result(version, latency_ms, success).await)
    }

    pub async fn get(&self, pipeline_name: &str) -> Option<std::sync::Arc<CanaryState>> {
        self.rollouts.read().await.get(pipeline_name).cloned()
    }

    pub async fn remove(&self, pipeline_name: &str) -> bool {
        self.rollouts.write().await.remove(pipeline_name).is_some()
    }

    pub async fn list(&self) -> Vec<std::sync::Arc<CanaryState>> {
        self.rollouts.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(overrides: impl FnOnce(&mut CanaryConfig)) -> CanaryConfig {
        let mut c = CanaryConfig::default();
        overrides(&mut c);
        c
    }

    #[tokio::test]
    async fn select_version_respects_zero_weight() {
        let state = CanaryState::new("p", 1, 2, config(|c| c.initial_weight = 0.0)).unwrap();
        for _ in 0..20 {
            assert_eq!(state.select_version().await, 1);
        }
    }

    #[tokio::test]
    async fn below_min_requests_no_transition() {
        let state = CanaryState::new("p", 1, 2, config(|c| c.min_requests = 100)).unwrap();
        let transition = state.record_result(2, 5.0, false).await;
        assert_eq!(transition.status, CanaryStatus::Observing);
    }

    #[tokio::test]
    async fn rolls_back_on_high_error_rate() {
        let state = CanaryState::new(
            "p",
            1,
            2,
            config(|c| {
                c.min_requests = 2;
                c.error_threshold = 0.2;
            }),
        )
        .unwrap();
        for _ in 0..7 {
            state.record_result(2, 5.0, true).await;
        }
        let transition = state.record_result(2, 5.0, false).await;
        assert_eq!(transition.status, CanaryStatus::Observing); // 1/8 = 0.125, still under threshold
        let transition = state.record_result(2, 5.0, false).await;
        assert_eq!(transition.status, CanaryStatus::RolledBack); // 2/9 ~= 0.222 > 0.2
        assert_eq!(*state.current_weight.read().await, 0.0);
    }

    #[tokio::test]
    async fn rolls_back_on_latency_breach() {
        let state = CanaryState::new(
            "p",
            1,
            2,
            config(|c| {
                c.min_requests = 1;
                c.latency_threshold_ms = Some(100.0);
            }),
        )
        .unwrap();
        let transition = state.record_result(2, 500.0, true).await;
        assert_eq!(transition.status, CanaryStatus::RolledBack);
    }

    #[tokio::test]
    async fn min_requests_not_reached_blocks_rollback_too() {
        // Even a 100% error rate must not roll back below minRequests.
        let state = CanaryState::new("p", 1, 2, config(|c| c.min_requests = 10)).unwrap();
        for _ in 0..5 {
            let transition = state.record_result(2, 5.0, false).await;
            assert_eq!(transition.status, CanaryStatus::Observing);
        }
    }

    #[tokio::test]
    async fn auto_promote_single_step_reaches_complete_on_next_observation() {
        // One promotion step: the first qualifying observation takes the
        // weight to that step's value (still `Observing`, per spec.md
        // §4.4's "Else -> Promoting, ... status back to Observing"); the
        // *next* qualifying observation, with `currentStep` already at the
        // last index, flips to `Complete`.
        let state = CanaryState::new(
            "p",
            1,
            2,
            config(|c| {
                c.min_requests = 1;
                c.promotion_steps = vec![1.0];
                c.observation_window = Duration::from_millis(0);
                c.auto_promote = true;
            }),
        )
        .unwrap();

        let t1 = state.record_result(2, 5.0, true).await;
        assert_eq!(t1.status, CanaryStatus::Observing);
        assert_eq!(*state.current_weight.read().await, 1.0);

        let t2 = state.record_result(2, 5.0, true).await;
        assert_eq!(t2.status, CanaryStatus::Complete);
        assert_eq!(t2.newly_active_version, Some(2));
        assert_eq!(*state.current_weight.read().await, 1.0);
    }

    #[tokio::test]
    async fn auto_promote_multi_step_plan_advances_one_step_per_window() {
        let state = CanaryState::new(
            "p",
            1,
            2,
            config(|c| {
                c.min_requests = 1;
                c.promotion_steps = vec![0.5, 1.0];
                c.observation_window = Duration::from_millis(0);
                c.auto_promote = true;
            }),
        )
        .unwrap();

        let t1 = state.record_result(2, 5.0, true).await;
        assert_eq!(t1.status, CanaryStatus::Observing);
        assert_eq!(*state.current_weight.read().await, 0.5);

        let t2 = state.record_result(2, 5.0, true).await;
        assert_eq!(t2.status, CanaryStatus::Observing);
        assert_eq!(*state.current_weight.read().await, 1.0);

        let t3 = state.record_result(2, 5.0, true).await;
        assert_eq!(t3.status, CanaryStatus::Complete);
        assert_eq!(t3.newly_active_version, Some(2));
    }

    #[tokio::test]
    async fn manual_promote_is_idempotent_at_last_step() {
        let state = CanaryState::new("p", 1, 2, config(|c| c.promotion_steps = vec![1.0])).unwrap();
        let t1 = state.promote().await;
        assert_eq!(t1.status, CanaryStatus::Observing);
        let t2 = state.promote().await;
        assert_eq!(t2.status, CanaryStatus::Complete);
        assert_eq!(t2.newly_active_version, Some(2));
        // Already `Complete`: idempotent, and does not re-report the
        // activation (the caller already acted on it once).
        let t3 = state.promote().await;
        assert_eq!(t3.status, CanaryStatus::Complete);
        assert_eq!(t3.newly_active_version, None);
    }

    #[tokio::test]
    async fn manual_rollback_sets_zero_weight() {
        let state = CanaryState::new("p", 1, 2, CanaryConfig::default()).unwrap();
        state.rollback().await;
        assert_eq!(*state.status.read().await, CanaryStatus::RolledBack);
        assert_eq!(*state.current_weight.read().await, 0.0);
    }

    #[test]
    fn reservoir_caps_sample_count() {
        let metrics = VersionMetrics::default();
        for i in 0..(MAX_SAMPLES * 2) {
            metrics.record(i as f64, true);
        }
        assert_eq!(metrics.samples.lock().unwrap().len(), MAX_SAMPLES);
        assert_eq!(metrics.request_count(), (MAX_SAMPLES * 2) as u64);
    }

    #[tokio::test]
    async fn router_start_without_prior_version_synthesizes_version_one() {
        let router = CanaryRouter::new(CanaryConfig::default());
        let state = router.start("demo", None, 2).await.unwrap();
        assert_eq!(state.old_version, 1);
    }

    #[tokio::test]
    async fn router_rejects_invalid_promotion_steps() {
        let router = CanaryRouter::new(CanaryConfig::default());
        let err = router
            .start_with_config("demo", Some(1), 2, config(|c| c.promotion_steps = vec![0.5, 0.3, 1.0]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidRequest");
    }

    #[tokio::test]
    async fn no_canary_means_no_selection() {
        let router = CanaryRouter::new(CanaryConfig::default());
        assert!(router.select_version("nope").await.is_none());
        assert!(router.record_result("nope", 1, 5.0, true).await.is_none());
    }
}
