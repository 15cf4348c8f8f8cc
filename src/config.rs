//! Configuration for the scheduler and orchestrator
//!
//! Every field has a default so a partial TOML file (or none at all) is
//! enough to start the core.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StageMemError};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Optional knowledge table file (TOML or JSON) for the lookup executor
    pub knowledge_path: Option<String>,
    pub scheduler: SchedulerConfig,
    pub orchestrator: OrchestratorConfig,
}

impl CoreConfig {
    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: CoreConfig =
            toml::from_str(input).map_err(|e| StageMemError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file; `~` is expanded
    pub fn load(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        let content = std::fs::read_to_string(Path::new(&expanded))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| StageMemError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.orchestrator.validate()
    }
}

/// Thresholds and timing for stage transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Reads needed to leave the working stage
    pub access_threshold: u64,
    /// Importance that lifts an entry out of working regardless of reads
    pub importance_threshold: f32,
    /// Reads needed to reach long_term
    pub long_term_access_threshold: u64,
    /// Idle time after which a short_term entry falls back to working
    pub short_term_ttl_secs: u64,
    /// Idle time after which a low-importance long_term entry is evicted
    pub long_term_ttl_secs: u64,
    /// Long_term entries below this importance are eviction candidates
    pub eviction_importance_cutoff: f32,
    /// Idle time after which a read of a long_term entry demotes it
    pub staleness_threshold_secs: u64,
    /// Interval between periodic passes (0 = no periodic pass)
    pub interval_secs: u64,
    /// Run a pass after every result ingested by the orchestrator
    pub trigger_on_write: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            access_threshold: 5,
            importance_threshold: 0.8,
            long_term_access_threshold: 15,
            short_term_ttl_secs: 60 * 60,
            long_term_ttl_secs: 30 * 24 * 60 * 60,
            eviction_importance_cutoff: 0.2,
            staleness_threshold_secs: 7 * 24 * 60 * 60,
            interval_secs: 60,
            trigger_on_write: false,
        }
    }
}

impl SchedulerConfig {
    pub fn short_term_ttl(&self) -> chrono::Duration {
        secs(self.short_term_ttl_secs)
    }

    pub fn long_term_ttl(&self) -> chrono::Duration {
        secs(self.long_term_ttl_secs)
    }

    pub fn staleness_threshold(&self) -> chrono::Duration {
        secs(self.staleness_threshold_secs)
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }

    pub fn validate(&self) -> Result<()> {
        check_unit("scheduler.importance_threshold", self.importance_threshold)?;
        check_unit(
            "scheduler.eviction_importance_cutoff",
            self.eviction_importance_cutoff,
        )?;
        if self.access_threshold == 0 {
            return Err(StageMemError::Config(
                "scheduler.access_threshold must be at least 1".to_string(),
            ));
        }
        if self.long_term_access_threshold < self.access_threshold {
            return Err(StageMemError::Config(format!(
                "scheduler.long_term_access_threshold ({}) must not be below access_threshold ({})",
                self.long_term_access_threshold, self.access_threshold
            )));
        }
        Ok(())
    }
}

/// Seconds as a chrono duration, saturating at `chrono::Duration::MAX`
fn secs(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(StageMemError::Config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )))
    }
}

/// Exponential backoff between task retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows the given failure (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if base.is_finite() {
            base.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// A classification rule in configuration form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Regular expression matched against the request text
    pub pattern: String,
    pub kind: String,
}

/// Task dispatch settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Failures after which a task is terminally failed
    pub max_retries: u32,
    pub retry: RetryConfig,
    /// Maximum execution time of a single attempt
    pub task_timeout_ms: u64,
    /// Interval of the background dispatch loop
    pub tick_interval_ms: u64,
    /// Importance given to results, per task kind
    pub kind_importance: HashMap<String, f32>,
    /// Importance for kinds missing from `kind_importance`
    pub default_importance: f32,
    /// Replaces the built-in classification rules when set
    pub rules: Option<Vec<RuleConfig>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let kind_importance = [
            ("scrape", 0.6),
            ("search", 0.5),
            ("analyze", 0.7),
            ("lookup", 0.4),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            max_retries: 3,
            retry: RetryConfig::default(),
            task_timeout_ms: 60_000,
            tick_interval_ms: 100,
            kind_importance,
            default_importance: 0.5,
            rules: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn importance_for(&self, kind: &str) -> f32 {
        self.kind_importance
            .get(kind)
            .copied()
            .unwrap_or(self.default_importance)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(StageMemError::Config(
                "orchestrator.max_retries must be at least 1".to_string(),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(StageMemError::Config(
                "orchestrator.task_timeout_ms must be positive".to_string(),
            ));
        }
        let multiplier = self.retry.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(StageMemError::Config(
                "orchestrator.retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        check_unit("orchestrator.default_importance", self.default_importance)?;
        for (kind, value) in &self.kind_importance {
            check_unit(&format!("orchestrator.kind_importance.{}", kind), *value)?;
        }
        Ok(())
    }
}
