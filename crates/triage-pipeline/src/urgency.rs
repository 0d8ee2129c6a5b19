//! Two-stage urgency classification over a sentiment label and the feedback text.

use std::path::Path;

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use triage_core::{Sentiment, Urgency};

pub const SUPPORTED_RULES_VERSION: u32 = 1;

const BUILTIN_RULES_YAML: &str = include_str!("../../../rules/urgency.yaml");

static BUILTIN_RULES: Lazy<UrgencyRules> = Lazy::new(|| {
    UrgencyRules::from_yaml(BUILTIN_RULES_YAML).expect("embedded rules/urgency.yaml is valid")
});

#[derive(Debug, Clone, Deserialize)]
struct UrgencyRulesFile {
    version: u32,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    frequency: Vec<FrequencyRule>,
}

/// Escalates when `term` occurs at least `min_count` times.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FrequencyRule {
    pub term: String,
    pub min_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrgencyRules {
    keywords: Vec<String>,
    frequency: Vec<FrequencyRule>,
}

impl Default for UrgencyRules {
    fn default() -> Self {
        BUILTIN_RULES.clone()
    }
}

impl UrgencyRules {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: UrgencyRulesFile = serde_yaml::from_str(text).context("parsing urgency rules")?;
        if file.version != SUPPORTED_RULES_VERSION {
            bail!(
                "unsupported urgency rules version {} (expected {SUPPORTED_RULES_VERSION})",
                file.version
            );
        }

        let keywords = file
            .keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect::<Vec<_>>();

        let mut frequency = Vec::with_capacity(file.frequency.len());
        for rule in file.frequency {
            let term = rule.term.trim().to_lowercase();
            if term.is_empty() || rule.min_count == 0 {
                bail!("frequency rules need a non-empty term and a min_count of at least 1");
            }
            frequency.push(FrequencyRule {
                term,
                min_count: rule.min_count,
            });
        }

        Ok(Self {
            keywords,
            frequency,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn frequency_rules(&self) -> &[FrequencyRule] {
        &self.frequency
    }

    /// HIGH only for NEGATIVE feedback that hits a keyword or a frequency rule.
    pub fn classify(&self, text: &str, sentiment: Sentiment) -> Urgency {
        if sentiment != Sentiment::Negative {
            return Urgency::Low;
        }

        let lowered = text.to_lowercase();
        if self.keywords.iter().any(|k| lowered.contains(k.as_str())) {
            return Urgency::High;
        }

        let frequent = self
            .frequency
            .iter()
            .any(|rule| lowered.matches(rule.term.as_str()).count() >= rule.min_count);
        if frequent {
            Urgency::High
        } else {
            Urgency::Low
        }
    }
}

/// Classifies with the built-in rule table.
pub fn classify(text: &str, sentiment: Sentiment) -> Urgency {
    BUILTIN_RULES.classify(text, sentiment)
}
