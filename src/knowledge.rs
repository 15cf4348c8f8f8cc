//! Static knowledge table and the lookup executor that serves it
//!
//! The table maps a topic to a list of facts. It is loaded once and never
//! changes afterwards; lookups take `&self` only.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::agents::{AgentExecutor, ExecutionContext, ExecutionError};
use crate::error::{Result, StageMemError};

static BUILTIN: Lazy<Arc<KnowledgeBase>> = Lazy::new(|| {
    let topics = [
        (
            "working memory",
            vec![
                "Working memory holds fresh task results.",
                "Entries enter the store at the working stage.",
            ],
        ),
        (
            "short-term memory",
            vec![
                "Short-term memory holds entries that were read often or rated important.",
                "Idle short-term entries fall back to working memory.",
            ],
        ),
        (
            "long-term memory",
            vec![
                "Long-term memory holds entries that kept being read.",
                "Idle, unimportant long-term entries are evicted.",
            ],
        ),
        (
            "agent",
            vec![
                "An agent runs one task at a time.",
                "An agent only takes task kinds listed in its capabilities.",
            ],
        ),
        (
            "task",
            vec![
                "A task moves from queued to running and ends completed, failed or cancelled.",
                "Failed attempts are retried with exponential backoff.",
            ],
        ),
    ];
    Arc::new(KnowledgeBase::from_pairs(topics.into_iter().map(|(topic, facts)| {
        (topic.to_string(), facts.into_iter().map(str::to_string).collect())
    })))
});

fn normalize(topic: &str) -> String {
    topic
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnowledgeFile {
    #[serde(default)]
    topics: BTreeMap<String, Vec<String>>,
}

/// Immutable topic → facts table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnowledgeBase {
    topics: BTreeMap<String, Vec<String>>,
}

impl KnowledgeBase {
    /// The table shipped with the crate
    pub fn builtin() -> Arc<KnowledgeBase> {
        Arc::clone(&BUILTIN)
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut topics: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (topic, facts) in pairs {
            topics.entry(normalize(&topic)).or_default().extend(facts);
        }
        Self { topics }
    }

    /// Parse `[topics]` with one array of facts per topic
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let file: KnowledgeFile = toml::from_str(input)
            .map_err(|e| StageMemError::Config(format!("invalid knowledge file: {}", e)))?;
        Ok(Self::from_pairs(file.topics))
    }

    /// Parse `{"topics": {"name": ["fact", ...]}}`
    pub fn from_json_str(input: &str) -> Result<Self> {
        let file: KnowledgeFile = serde_json::from_str(input)?;
        Ok(Self::from_pairs(file.topics))
    }

    /// Load from a `.toml` or `.json` file; `~` is expanded
    pub fn load(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        let content = std::fs::read_to_string(&expanded)?;
        let is_json = Path::new(&expanded)
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        let kb = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_toml_str(&content)?
        };
        tracing::info!(path = %expanded, topics = kb.len(), "Knowledge base loaded");
        Ok(kb)
    }

    /// Facts for an exact topic, ignoring case and extra whitespace
    pub fn lookup(&self, topic: &str) -> Option<&[String]> {
        self.topics.get(&normalize(topic)).map(Vec::as_slice)
    }

    /// Find the topic a free-text question is about: an exact match first,
    /// otherwise the longest topic mentioned in the text.
    pub fn resolve(&self, text: &str) -> Option<(&str, &[String])> {
        let needle = normalize(text);
        if let Some((topic, facts)) = self.topics.get_key_value(&needle) {
            return Some((topic.as_str(), facts.as_slice()));
        }
        self.topics
            .iter()
            .filter(|(topic, _)| contains_phrase(&needle, topic))
            .max_by_key(|(topic, _)| topic.len())
            .map(|(topic, facts)| (topic.as_str(), facts.as_slice()))
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

// phrase match on word boundaries
fn contains_phrase(text: &str, phrase: &str) -> bool {
    text.match_indices(phrase).any(|(start, _)| {
        let end = start + phrase.len();
        let before_ok = text[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = text[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}

/// Answers `lookup` tasks from a [`KnowledgeBase`]
pub struct KnowledgeExecutor {
    kb: Arc<KnowledgeBase>,
}

impl KnowledgeExecutor {
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        Self { kb }
    }
}

#[async_trait]
impl AgentExecutor for KnowledgeExecutor {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
    ) -> std::result::Result<serde_json::Value, ExecutionError> {
        let question = ctx
            .payload
            .get("topic")
            .or_else(|| ctx.payload.get("text"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExecutionError::failed("lookup payload has no text"))?;

        let (topic, facts) = self
            .kb
            .resolve(question)
            .ok_or_else(|| ExecutionError::failed(format!("no knowledge about '{}'", question)))?;

        Ok(serde_json::json!({
            "topic": topic,
            "facts": facts,
        }))
    }
}
