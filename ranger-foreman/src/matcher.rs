//! Rule clause evaluation, with a cache over compiled regexes (§4.6
//! "expensive checks (regex compile) are cached").

use crate::attributes::ClientAttributes;
use dashmap::DashMap;
use ranger_proto::{ClientRuleClause, ClientRuleSet, CompareOp};
use regex::Regex;
use std::sync::Arc;

#[derive(Default)]
pub struct RegexCache {
    compiled: DashMap<String, Arc<Regex>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_compile(&self, pattern: &str) -> Result<Arc<Regex>, regex::Error> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re.clone());
        }
        let re = Arc::new(Regex::new(pattern)?);
        self.compiled.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

fn compare(op: CompareOp, lhs: i64, rhs: i64) -> bool {
    match op {
        CompareOp::Lt => lhs < rhs,
        CompareOp::Le => lhs <= rhs,
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ge => lhs >= rhs,
        CompareOp::Gt => lhs > rhs,
    }
}

/// Evaluate one clause. A clause referencing an attribute the client hasn't
/// reported never matches (missing data is not a wildcard).
pub fn clause_matches(cache: &RegexCache, clause: &ClientRuleClause, attrs: &ClientAttributes) -> bool {
    match clause {
        ClientRuleClause::Regex { attribute, pattern } => {
            let Some(value) = attrs.get(attribute) else {
                return false;
            };
            match cache.get_or_compile(pattern) {
                Ok(re) => re.is_match(value),
                Err(_) => false,
            }
        }
        ClientRuleClause::IntegerCompare { attribute, op, value } => {
            attrs.get_int(attribute).map(|lhs| compare(*op, lhs, *value)).unwrap_or(false)
        }
        ClientRuleClause::LabelSet { labels } => attrs.has_all_labels(labels),
        ClientRuleClause::Os { allowed } => attrs.get("os").map(|os| allowed.iter().any(|a| a == os)).unwrap_or(false),
    }
}

/// A `ClientRuleSet` is the AND of all its clauses; an empty set matches
/// unconditionally (§3 "ForemanRule").
pub fn rule_set_matches(cache: &RegexCache, rule_set: &ClientRuleSet, attrs: &ClientAttributes) -> bool {
    rule_set.clauses.iter().all(|clause| clause_matches(cache, clause, attrs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ranger_proto::ClientRuleSet;

    fn attrs_with(pairs: &[(&str, &str)], labels: &[&str]) -> ClientAttributes {
        let mut a = ClientAttributes::default();
        for (k, v) in pairs {
            a.set_for_test(k, v);
        }
        for l in labels {
            a.label_for_test(l);
        }
        a
    }

    #[test]
    fn os_clause_matches_allowed_list() {
        let cache = RegexCache::new();
        let attrs = attrs_with(&[("os", "linux")], &[]);
        let clause = ClientRuleClause::Os {
            allowed: vec!["linux".to_string(), "darwin".to_string()],
        };
        assert!(clause_matches(&cache, &clause, &attrs));
    }

    #[test]
    fn integer_compare_respects_operator() {
        let cache = RegexCache::new();
        let attrs = attrs_with(&[("last_boot_time", "1000")], &[]);
        let clause = ClientRuleClause::IntegerCompare {
            attribute: "last_boot_time".to_string(),
            op: CompareOp::Ge,
            value: 500,
        };
        assert!(clause_matches(&cache, &clause, &attrs));

        let clause = ClientRuleClause::IntegerCompare {
            attribute: "last_boot_time".to_string(),
            op: CompareOp::Lt,
            value: 500,
        };
        assert!(!clause_matches(&cache, &clause, &attrs));
    }

    #[test]
    fn label_set_requires_every_label() {
        let cache = RegexCache::new();
        let attrs = attrs_with(&[], &["prod", "eu"]);
        let clause = ClientRuleClause::LabelSet {
            labels: vec!["prod".to_string(), "eu".to_string()],
        };
        assert!(clause_matches(&cache, &clause, &attrs));

        let clause = ClientRuleClause::LabelSet {
            labels: vec!["prod".to_string(), "us".to_string()],
        };
        assert!(!clause_matches(&cache, &clause, &attrs));
    }

    #[test]
    fn rule_set_is_conjunction_of_clauses() {
        let cache = RegexCache::new();
        let attrs = attrs_with(&[("os", "linux")], &["prod"]);
        let rule_set = ClientRuleSet {
            clauses: vec![
                ClientRuleClause::Os { allowed: vec!["linux".to_string()] },
                ClientRuleClause::LabelSet { labels: vec!["staging".to_string()] },
            ],
        };
        assert!(!rule_set_matches(&cache, &rule_set, &attrs), "one unmet clause fails the whole set");
    }
}
