//! Heuristic test quality scoring and duplicate resolution.
//!
//! The weights below are tuning knobs, not a contract.

use super::{SuiteIndex, TestCase};
use crate::config::Rules;
use std::collections::HashMap;

const ASSERTION_WEIGHT: i64 = 10;
const DESCRIPTIVE_NAME_BONUS: i64 = 15;
const POSITIVE_CASE_BONUS: i64 = 10;
const NEGATIVE_CASE_BONUS: i64 = 10;
const FIXTURE_HOOK_BONUS: i64 = 5;
const EDGE_CASE_PENALTY: i64 = 20;

/// Names longer than this with a separator count as descriptive
const DESCRIPTIVE_MIN_LEN: usize = 10;
const NAME_SEPARATOR: char = '_';

const POSITIVE_HINTS: &[&str] = &["success", "valid", "positive"];
const NEGATIVE_HINTS: &[&str] = &["fail", "invalid", "negative", "error"];
const FIXTURE_HOOKS: &[&str] = &["setup", "teardown"];

/// Scores test cases against the configured test rules.
#[derive(Debug, Clone)]
pub struct QualityScorer {
    preferred_assertions: Vec<String>,
    want_positive: bool,
    want_negative: bool,
    /// Lowercased, deduplicated
    edge_tokens: Vec<String>,
}

impl QualityScorer {
    pub fn from_rules(rules: &Rules) -> Self {
        let mut edge_tokens: Vec<String> = Vec::new();
        for token in &rules.test_case_rules.avoid_edge_cases {
            let token = token.trim().to_lowercase();
            if !token.is_empty() && !edge_tokens.contains(&token) {
                edge_tokens.push(token);
            }
        }

        Self {
            preferred_assertions: rules
                .assertions
                .preferred
                .iter()
                .filter(|a| !a.is_empty())
                .cloned()
                .collect(),
            want_positive: rules.test_case_rules.include_positive_case,
            want_negative: rules.test_case_rules.include_negative_case,
            edge_tokens,
        }
    }

    pub fn score(&self, case: &TestCase) -> i64 {
        let mut score = 0;

        let assertions: usize = self
            .preferred_assertions
            .iter()
            .map(|a| case.body.matches(a.as_str()).count())
            .sum();
        score += ASSERTION_WEIGHT * assertions as i64;

        if is_descriptive(&case.name) {
            score += DESCRIPTIVE_NAME_BONUS;
        }

        let name = case.name.to_lowercase();
        if self.want_positive && POSITIVE_HINTS.iter().any(|h| name.contains(h)) {
            score += POSITIVE_CASE_BONUS;
        }
        if self.want_negative && NEGATIVE_HINTS.iter().any(|h| name.contains(h)) {
            score += NEGATIVE_CASE_BONUS;
        }

        let body = case.body.to_lowercase();
        if FIXTURE_HOOKS.iter().any(|h| body.contains(h)) {
            score += FIXTURE_HOOK_BONUS;
        }

        let edge_hits = self
            .edge_tokens
            .iter()
            .filter(|t| body.contains(t.as_str()))
            .count();
        score -= EDGE_CASE_PENALTY * edge_hits as i64;

        score
    }

    /// Keep exactly one case per `(suite, name)`: the highest scoring, or the
    /// first seen on a tie. Surviving cases keep their first-seen position.
    pub fn resolve(&self, index: SuiteIndex) -> SuiteIndex {
        let mut resolved = SuiteIndex::new();

        for (suite, cases) in index.into_suites() {
            let mut kept: Vec<(i64, TestCase)> = Vec::new();
            let mut slot_of: HashMap<String, usize> = HashMap::new();

            for case in cases {
                let score = self.score(&case);
                match slot_of.get(&case.name) {
                    Some(&slot) => {
                        let (best, current) = &kept[slot];
                        if score > *best {
                            tracing::debug!(
                                "{}.{}: {} (score {}) replaces {} (score {})",
                                suite,
                                case.name,
                                case.file.display(),
                                score,
                                current.file.display(),
                                best
                            );
                            kept[slot] = (score, case);
                        } else {
                            tracing::debug!(
                                "{}.{}: dropping duplicate from {} (score {} <= {})",
                                suite,
                                case.name,
                                case.file.display(),
                                score,
                                best
                            );
                        }
                    }
                    None => {
                        slot_of.insert(case.name.clone(), kept.len());
                        kept.push((score, case));
                    }
                }
            }

            for (_, case) in kept {
                resolved.insert(case);
            }
        }

        resolved
    }
}

fn is_descriptive(name: &str) -> bool {
    name.len() > DESCRIPTIVE_MIN_LEN && name.contains(NAME_SEPARATOR)
}
