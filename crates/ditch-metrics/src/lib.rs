use chrono::{DateTime, Utc};
use ditch_core::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Process-wide accounting of the usage reported by the completion endpoint.
pub struct TokenTracker {
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    calls: AtomicU64,
    model_stats: RwLock<HashMap<String, ModelTokenStats>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTokenStats {
    pub model_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub calls: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStatistics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub calls: u64,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self {
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            model_stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, model: &str, usage: &TokenUsage) {
        let prompt = u64::from(usage.prompt_tokens);
        let completion = u64::from(usage.completion_tokens);

        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);

        let mut stats = self
            .model_stats
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let model_stat = stats.entry(model.to_string()).or_insert_with(|| ModelTokenStats {
            model_id: model.to_string(),
            ..Default::default()
        });
        model_stat.prompt_tokens += prompt;
        model_stat.completion_tokens += completion;
        model_stat.calls += 1;

        debug!(
            model,
            prompt = usage.prompt_tokens,
            completion = usage.completion_tokens,
            "Recorded token usage"
        );
    }

    pub fn get_stats(&self) -> TokenStatistics {
        let prompt_tokens = self.prompt_tokens.load(Ordering::Relaxed);
        let completion_tokens = self.completion_tokens.load(Ordering::Relaxed);
        TokenStatistics {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            calls: self.calls.load(Ordering::Relaxed),
        }
    }

    pub fn get_model_stats(&self) -> HashMap<String, ModelTokenStats> {
        self.model_stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for TokenTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts banter requests and the remote attempts they made.
pub struct RequestMetrics {
    requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    attempts: AtomicU64,
    total_latency_ms: AtomicU64,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_attempts: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub uptime_seconds: u64,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, duration: Duration, success: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);

        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_average_latency(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            0.0
        } else {
            self.total_latency_ms.load(Ordering::Relaxed) as f64 / requests as f64
        }
    }

    pub fn get_success_rate(&self) -> f64 {
        let requests = self.requests.load(Ordering::Relaxed);
        if requests == 0 {
            0.0
        } else {
            self.successful_requests.load(Ordering::Relaxed) as f64 / requests as f64 * 100.0
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_requests: self.requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            total_attempts: self.attempts.load(Ordering::Relaxed),
            success_rate: self.get_success_rate(),
            average_latency_ms: self.get_average_latency(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}
