//! Model health and failover.
//!
//! Failures are classified from their error text. Transient categories
//! (rate limit, timeout, overload) put a model into a short cooldown once
//! `failure_threshold` consecutive failures accumulate; auth and billing
//! errors put it into a long cooldown immediately. [`ModelHealthTracker::select_model`]
//! walks `[primary, ...fallbacks]` and returns the first model not cooling
//! down, or the primary when every model is.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use metrics::gauge;
use parking_lot::Mutex;
use regex::RegexSet;
use serde::Serialize;
use switchyard_core::metrics::MODEL_COOLDOWN;
use switchyard_settings::ModelFailoverSettings;
use tokio::time::Instant;
use tracing::{info, warn};

/// Failure category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 429 and quota errors.
    RateLimit,
    /// Bad or missing credentials.
    Auth,
    /// Payment required.
    Billing,
    /// Request or turn timed out.
    Timeout,
    /// Provider overloaded or unavailable.
    Overloaded,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// Snake-case label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Billing => "billing",
            Self::Timeout => "timeout",
            Self::Overloaded => "overloaded",
            Self::Unknown => "unknown",
        }
    }

    /// Worth retrying on another model.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::Overloaded)
    }

    /// Needs operator action before the model works again.
    pub fn is_permanent(self) -> bool {
        matches!(self, Self::Auth | Self::Billing)
    }
}

static PATTERNS: LazyLock<Vec<(ErrorCategory, RegexSet)>> = LazyLock::new(|| {
    let table: [(ErrorCategory, &[&str]); 5] = [
        (
            ErrorCategory::RateLimit,
            &[r"429", r"rate.?limit", r"quota", r"too many requests", r"retry.?after"],
        ),
        (
            ErrorCategory::Auth,
            &[r"401", r"403", r"unauthorized", r"forbidden", r"invalid.?api.?key"],
        ),
        (
            ErrorCategory::Billing,
            &[r"402", r"payment", r"billing", r"insufficient.?funds"],
        ),
        (ErrorCategory::Timeout, &[r"timeout", r"timed?\s*out", r"etimedout"]),
        (
            ErrorCategory::Overloaded,
            &[r"503", r"overloaded", r"capacity", r"unavailable", r"529"],
        ),
    ];
    table
        .into_iter()
        .filter_map(|(category, patterns)| {
            let case_insensitive: Vec<String> = patterns.iter().map(|p| format!("(?i){p}")).collect();
            RegexSet::new(case_insensitive).ok().map(|set| (category, set))
        })
        .collect()
});

/// Classify an error message. The first matching category wins.
pub fn classify_error(text: &str) -> ErrorCategory {
    PATTERNS
        .iter()
        .find(|(_, set)| set.is_match(text))
        .map_or(ErrorCategory::Unknown, |(category, _)| *category)
}

#[derive(Clone, Debug)]
struct HealthEntry {
    failures: u32,
    last_error: Option<String>,
    last_category: Option<ErrorCategory>,
    cooldown_until: Option<Instant>,
}

/// Diagnostic view of one model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelHealth {
    /// Model id.
    pub model: String,
    /// Consecutive failures.
    pub failures: u32,
    /// Last error text, truncated.
    pub last_error: Option<String>,
    /// Category of the last error.
    pub last_category: Option<ErrorCategory>,
    /// Remaining cooldown in milliseconds.
    pub cooldown_remaining_ms: u64,
}

/// Per-model failure counters and cooldowns.
pub struct ModelHealthTracker {
    failure_threshold: u32,
    cooldown: Duration,
    permanent_cooldown: Duration,
    states: Mutex<HashMap<String, HealthEntry>>,
}

impl ModelHealthTracker {
    /// Tracker from failover settings.
    pub fn new(settings: &ModelFailoverSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            cooldown: Duration::from_millis(settings.cooldown_ms),
            permanent_cooldown: Duration::from_millis(settings.permanent_cooldown_ms),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return its category.
    pub fn record_failure(&self, model: &str, error_text: &str) -> ErrorCategory {
        let category = classify_error(error_text);
        let now = Instant::now();
        let mut states = self.states.lock();
        let entry = states.entry(model.to_string()).or_insert_with(|| HealthEntry {
            failures: 0,
            last_error: None,
            last_category: None,
            cooldown_until: None,
        });
        entry.failures += 1;
        entry.last_error = Some(error_text.chars().take(200).collect());
        entry.last_category = Some(category);

        let cooldown = if category.is_permanent() {
            Some(self.permanent_cooldown)
        } else if category.is_transient() && entry.failures >= self.failure_threshold {
            Some(self.cooldown)
        } else {
            None
        };
        if let Some(cooldown) = cooldown {
            entry.cooldown_until = Some(now + cooldown);
            gauge!(MODEL_COOLDOWN, "model" => model.to_string()).set(1.0);
            warn!(
                model,
                category = category.as_str(),
                failures = entry.failures,
                cooldown_ms = cooldown.as_millis() as u64,
                "model entered cooldown"
            );
        }
        category
    }

    /// Reset a model after a successful turn.
    pub fn record_success(&self, model: &str) {
        let mut states = self.states.lock();
        if let Some(entry) = states.get_mut(model) {
            if entry.failures > 0 || entry.cooldown_until.is_some() {
                info!(model, "model recovered");
            }
            entry.failures = 0;
            entry.cooldown_until = None;
            entry.last_error = None;
            entry.last_category = None;
            gauge!(MODEL_COOLDOWN, "model" => model.to_string()).set(0.0);
        }
    }

    /// Whether a model is cooling down.
    pub fn is_in_cooldown(&self, model: &str) -> bool {
        let now = Instant::now();
        self.states
            .lock()
            .get(model)
            .and_then(|e| e.cooldown_until)
            .is_some_and(|until| now < until)
    }

    /// First model of the chain not in cooldown; the primary when all are.
    /// `None` only for an empty chain.
    pub fn select_model<'a>(&self, chain: &'a [String]) -> Option<&'a str> {
        let primary = chain.first()?;
        let chosen = chain
            .iter()
            .find(|m| !self.is_in_cooldown(m))
            .unwrap_or(primary);
        if chosen != primary {
            info!(primary = %primary, fallback = %chosen, "using fallback model");
        }
        Some(chosen.as_str())
    }

    /// Health of every tracked model.
    pub fn snapshot(&self) -> Vec<ModelHealth> {
        let now = Instant::now();
        let mut out: Vec<ModelHealth> = self
            .states
            .lock()
            .iter()
            .map(|(model, e)| ModelHealth {
                model: model.clone(),
                failures: e.failures,
                last_error: e.last_error.clone(),
                last_category: e.last_category,
                cooldown_remaining_ms: e
                    .cooldown_until
                    .map_or(0, |until| until.saturating_duration_since(now).as_millis() as u64),
            })
            .collect();
        out.sort_by(|a, b| a.model.cmp(&b.model));
        out
    }
}

impl std::fmt::Debug for ModelHealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHealthTracker")
            .field("failure_threshold", &self.failure_threshold)
            .field("tracked", &self.states.lock().len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
