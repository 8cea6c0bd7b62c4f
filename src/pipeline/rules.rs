//! Enrichment engine: table-driven classification of normalized messages.
//!
//! Every signal is derived from one lower-cased haystack
//! (`subject + " " + body`) by substring containment against fixed
//! vocabularies. Rules are evaluated in list order and the first match wins:
//! - priority: urgent vocabulary, then support vocabulary, else low
//! - sentiment: positive vocabulary, then negative vocabulary, else neutral
//!
//! The engine is a pure function of `(subject, body_text)`.

use tracing::debug;

use crate::pipeline::entities::EntityExtractor;
use crate::pipeline::types::{EnrichedMessage, NormalizedMessage, Priority, Sentiment};

/// Upper bound on `priority_score`.
pub const SCORE_CEILING: f64 = 5.0;

/// Added once per distinct boost term present.
pub const BOOST_STEP: f64 = 0.5;

const URGENT_TERMS: &[&str] = &[
    "urgent",
    "critical",
    "emergency",
    "immediate",
    "asap",
    "downtime",
    "blocked",
    "system down",
];

const MEDIUM_TERMS: &[&str] = &["help", "support", "issue", "problem", "error", "billing"];

const POSITIVE_TERMS: &[&str] = &["thank", "great", "excellent", "good", "happy", "satisfied"];

const NEGATIVE_TERMS: &[&str] = &[
    "angry",
    "frustrated",
    "terrible",
    "awful",
    "disappointed",
    "upset",
    "critical",
    "urgent",
];

const BOOST_TERMS: &[&str] = &["critical", "emergency", "immediate", "downtime"];

const INTAKE_TERMS: &[&str] = &[
    "support",
    "query",
    "request",
    "help",
    "issue",
    "problem",
    "error",
    "assistance",
];

/// A named, lower-cased term list.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    name: &'static str,
    terms: Vec<String>,
}

impl Vocabulary {
    pub fn new(name: &'static str, terms: &[&str]) -> Self {
        Self {
            name,
            terms: terms.iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `haystack` must already be lower-cased.
    pub fn contains_any(&self, haystack: &str) -> bool {
        self.terms.iter().any(|t| haystack.contains(t.as_str()))
    }

    /// Terms present in `haystack`, in vocabulary order.
    pub fn matches<'a>(&'a self, haystack: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.terms
            .iter()
            .map(String::as_str)
            .filter(move |t| haystack.contains(t))
    }
}

/// One step of the priority precedence list.
#[derive(Debug, Clone)]
pub struct PriorityRule {
    pub priority: Priority,
    pub vocabulary: Vocabulary,
}

/// One step of the sentiment precedence list.
#[derive(Debug, Clone)]
pub struct SentimentRule {
    pub sentiment: Sentiment,
    pub vocabulary: Vocabulary,
}

/// Deterministic classifier producing priority, sentiment, score,
/// filter flag, and entities.
#[derive(Debug, Clone)]
pub struct EnrichmentEngine {
    priority_rules: Vec<PriorityRule>,
    sentiment_rules: Vec<SentimentRule>,
    boosts: Vocabulary,
    intake: Vocabulary,
    extractor: EntityExtractor,
}

impl Default for EnrichmentEngine {
    fn default() -> Self {
        Self::default_rules()
    }
}

impl EnrichmentEngine {
    /// Engine with the support-desk vocabularies.
    pub fn default_rules() -> Self {
        Self {
            priority_rules: vec![
                PriorityRule {
                    priority: Priority::Urgent,
                    vocabulary: Vocabulary::new("urgent", URGENT_TERMS),
                },
                PriorityRule {
                    priority: Priority::Medium,
                    vocabulary: Vocabulary::new("support", MEDIUM_TERMS),
                },
            ],
            sentiment_rules: vec![
                SentimentRule {
                    sentiment: Sentiment::Positive,
                    vocabulary: Vocabulary::new("positive", POSITIVE_TERMS),
                },
                SentimentRule {
                    sentiment: Sentiment::Negative,
                    vocabulary: Vocabulary::new("negative", NEGATIVE_TERMS),
                },
            ],
            boosts: Vocabulary::new("urgent-boost", BOOST_TERMS),
            intake: Vocabulary::new("intake", INTAKE_TERMS),
            extractor: EntityExtractor::default(),
        }
    }

    /// Lower-cased `subject + " " + body`.
    pub fn haystack(subject: &str, body: &str) -> String {
        format!("{subject} {body}").to_lowercase()
    }

    /// First priority rule whose vocabulary hits, if any.
    pub fn matched_priority_rule(&self, haystack: &str) -> Option<&PriorityRule> {
        self.priority_rules
            .iter()
            .find(|r| r.vocabulary.contains_any(haystack))
    }

    pub fn classify_priority(&self, haystack: &str) -> Priority {
        self.matched_priority_rule(haystack)
            .map_or(Priority::Low, |r| r.priority)
    }

    pub fn classify_sentiment(&self, haystack: &str) -> Sentiment {
        self.sentiment_rules
            .iter()
            .find(|r| r.vocabulary.contains_any(haystack))
            .map_or(Sentiment::Neutral, |r| r.sentiment)
    }

    /// Tier base plus `BOOST_STEP` per distinct boost term, capped at `SCORE_CEILING`.
    pub fn score(&self, priority: Priority, haystack: &str) -> f64 {
        let boosts = self.boosts.matches(haystack).count() as f64;
        (priority.base_score() + boosts * BOOST_STEP).min(SCORE_CEILING)
    }

    pub fn is_intake(&self, haystack: &str) -> bool {
        self.intake.contains_any(haystack)
    }

    /// Apply every derived signal to a fresh record.
    pub fn enrich(&self, message: NormalizedMessage) -> EnrichedMessage {
        let haystack = Self::haystack(&message.subject, &message.body_text);
        let rule = self.matched_priority_rule(&haystack);
        let priority = rule.map_or(Priority::Low, |r| r.priority);
        let sentiment = self.classify_sentiment(&haystack);
        let priority_score = self.score(priority, &haystack);
        let is_filtered = self.is_intake(&haystack);
        let entities = self.extractor.extract(&message.subject, &message.body_text);

        debug!(
            id = %message.id,
            priority = priority.label(),
            rule = rule.map_or("none", |r| r.vocabulary.name()),
            score = priority_score,
            entities = entities.len(),
            "Enriched message"
        );

        let mut enriched = EnrichedMessage::pending(message);
        enriched.priority = priority;
        enriched.sentiment = sentiment;
        enriched.priority_score = priority_score;
        enriched.is_filtered = is_filtered;
        enriched.entities = entities;
        enriched
    }
}
