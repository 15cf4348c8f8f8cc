//! Request classification
//!
//! Ordered `(pattern, kind)` rules; the first rule whose pattern matches the
//! request text decides the task kind.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::RuleConfig;
use crate::error::{Result, StageMemError};
use crate::types::TaskKind;

/// One classification rule
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub pattern: Regex,
    pub kind: TaskKind,
}

impl ClassificationRule {
    pub fn new(pattern: &str, kind: impl Into<TaskKind>) -> Result<Self> {
        let kind = kind.into();
        let pattern = Regex::new(pattern).map_err(|e| {
            StageMemError::Config(format!("invalid pattern for kind '{}': {}", kind, e))
        })?;
        Ok(Self { pattern, kind })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

// Built-in rules, checked in this order
static BUILTIN_RULES: Lazy<Vec<ClassificationRule>> = Lazy::new(|| {
    [
        (r"(?i)\b(scrape|crawl)\b|https?://", "scrape"),
        (r"(?i)\b(analy[sz]e|summari[sz]e|compare|evaluate)\b", "analyze"),
        (r"(?i)\b(search|find|look\s+for|query)\b", "search"),
        (r"(?i)\b(what\s+is|who\s+is|define|lookup|look\s+up|explain)\b", "lookup"),
    ]
    .into_iter()
    .map(|(pattern, kind)| ClassificationRule {
        pattern: Regex::new(pattern).expect("built-in classification pattern"),
        kind: kind.to_string(),
    })
    .collect()
});

/// Maps request text to a task kind
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            rules: BUILTIN_RULES.clone(),
        }
    }
}

impl Classifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Compile rules from configuration, keeping their order
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|r| ClassificationRule::new(&r.pattern, r.kind.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn classify(&self, text: &str) -> Result<TaskKind> {
        self.rules
            .iter()
            .find(|rule| rule.matches(text))
            .map(|rule| rule.kind.clone())
            .ok_or_else(|| StageMemError::UnclassifiableRequest(text.to_string()))
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Distinct kinds in rule order
    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = Vec::new();
        for rule in &self.rules {
            if !kinds.contains(&rule.kind) {
                kinds.push(rule.kind.clone());
            }
        }
        kinds
    }
}
