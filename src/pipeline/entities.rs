//! Entity extraction: phones, email addresses, order references, issue keywords.
//!
//! Passes run in a fixed order and ids are assigned sequentially across all
//! passes, so the output order is the extraction order.

use std::sync::LazyLock;

use regex::Regex;

use crate::pipeline::rules::Vocabulary;
use crate::pipeline::types::{Entity, EntityType};

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\+?[1-9]?[-\s]?\(?[0-9]{3}\)?[-\s]?[0-9]{3}[-\s]?[0-9]{4}")
        .expect("phone pattern compiles")
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("email pattern compiles")
});

// "order #ABC-99", "ORD-5521", "order number 12", "ord XYZ". Not "ordered".
static ORDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:order|ord)\b\s*(?:#|-|no\.?|number)?\s*:?\s*[a-z0-9][a-z0-9-]*")
        .expect("order pattern compiles")
});

const ISSUE_TERMS: &[&str] = &[
    "login",
    "password",
    "billing",
    "access",
    "verification",
    "downtime",
    "api",
    "integration",
];

#[derive(Debug, Clone)]
pub struct EntityExtractor {
    issues: Vocabulary,
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self {
            issues: Vocabulary::new("issue", ISSUE_TERMS),
        }
    }
}

impl EntityExtractor {
    /// Pattern passes scan `body` only; the issue pass scans subject and body.
    pub fn extract(&self, subject: &str, body: &str) -> Vec<Entity> {
        let mut entities = Vec::new();
        let mut next_id = 1_u32;
        let mut push = |entity_type: EntityType, value: &str| {
            entities.push(Entity {
                id: next_id,
                entity_type,
                value: value.to_string(),
            });
            next_id += 1;
        };

        for m in PHONE_RE.find_iter(body) {
            push(EntityType::Phone, m.as_str().trim());
        }
        for m in EMAIL_RE.find_iter(body) {
            push(EntityType::Email, m.as_str());
        }
        for m in ORDER_RE.find_iter(body) {
            push(EntityType::OrderId, m.as_str().trim());
        }

        let haystack = format!("{subject} {body}").to_lowercase();
        for term in self.issues.matches(&haystack) {
            push(EntityType::Issue, term);
        }

        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(entities: &[Entity]) -> Vec<(EntityType, &str)> {
        entities
            .iter()
            .map(|e| (e.entity_type, e.value.as_str()))
            .collect()
    }

    #[test]
    fn phone_then_order() {
        let out = EntityExtractor::default().extract("", "call me at 555-123-4567, order #ABC-99");
        assert_eq!(
            kinds(&out),
            vec![
                (EntityType::Phone, "555-123-4567"),
                (EntityType::OrderId, "order #ABC-99"),
            ]
        );
        assert_eq!(out[0].id, 1);
        assert_eq!(out[1].id, 2);
    }

    #[test]
    fn phone_variants() {
        let out = EntityExtractor::default().extract("", "office (555) 123-4567 or +1 555 987 6543");
        let phones: Vec<&str> = out
            .iter()
            .filter(|e| e.entity_type == EntityType::Phone)
            .map(|e| e.value.as_str())
            .collect();
        assert_eq!(phones, vec!["(555) 123-4567", "+1 555 987 6543"]);
    }

    #[test]
    fn email_addresses() {
        let out = EntityExtractor::default().extract("", "cc jane.doe@example.co.uk and ops@corp.io");
        assert_eq!(
            kinds(&out),
            vec![
                (EntityType::Email, "jane.doe@example.co.uk"),
                (EntityType::Email, "ops@corp.io"),
            ]
        );
    }

    #[test]
    fn order_reference_forms() {
        let out = EntityExtractor::default().extract("", "ORD-5521 and Order number 77 but not ordered items");
        let orders: Vec<&str> = out
            .iter()
            .filter(|e| e.entity_type == EntityType::OrderId)
            .map(|e| e.value.as_str())
            .collect();
        assert_eq!(orders, vec!["ORD-5521", "Order number 77"]);
    }

    #[test]
    fn order_identifiers_may_be_all_letters() {
        let out = EntityExtractor::default().extract("", "about order ABCD please, ord XYZ");
        assert_eq!(
            kinds(&out),
            vec![
                (EntityType::OrderId, "order ABCD"),
                (EntityType::OrderId, "ord XYZ"),
            ]
        );
    }

    #[test]
    fn order_prefix_inside_a_word_is_ignored() {
        let out = EntityExtractor::default().extract("", "I ordered twice; reordering now.");
        assert!(out.iter().all(|e| e.entity_type != EntityType::OrderId));
    }

    #[test]
    fn issue_keywords_scan_subject_and_body_once_each() {
        let out = EntityExtractor::default().extract("Login failing", "login again, billing too. LOGIN!");
        assert_eq!(
            kinds(&out),
            vec![(EntityType::Issue, "login"), (EntityType::Issue, "billing")]
        );
    }

    #[test]
    fn patterns_ignore_subject() {
        let out = EntityExtractor::default().extract("call 555-123-4567", "nothing here");
        assert!(out.is_empty());
    }

    #[test]
    fn pass_order_and_sequential_ids() {
        let body = "order #Z9 from bob@example.com, phone 555-222-3333, api broken";
        let out = EntityExtractor::default().extract("", body);
        assert_eq!(
            kinds(&out),
            vec![
                (EntityType::Phone, "555-222-3333"),
                (EntityType::Email, "bob@example.com"),
                (EntityType::OrderId, "order #Z9"),
                (EntityType::Issue, "api"),
            ]
        );
        let ids: Vec<u32> = out.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(EntityExtractor::default().extract("", "").is_empty());
    }
}
