//! Composable scan filters for `Datastore::query` (§4.1 "Scan").

use ranger_proto::Subject;

/// A predicate over a subject's attributes, composable with `And`/`Or`.
#[derive(Debug, Clone)]
pub enum Filter {
    HasPredicate(String),
    PredicateMatches { predicate: String, pattern: String },
    PredicateLessThan { predicate: String, value: i64 },
    SubjectMatches(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }
}

/// Evaluate a filter against one subject's resolved predicate->value-as-text
/// view. `int_values` lets `PredicateLessThan` compare without re-parsing.
pub(crate) fn matches(
    filter: &Filter,
    subject: &Subject,
    predicates: &[String],
    text_of: impl Fn(&str) -> Option<String> + Copy,
    int_of: impl Fn(&str) -> Option<i64> + Copy,
) -> bool {
    match filter {
        Filter::HasPredicate(p) => predicates.iter().any(|x| x == p),
        Filter::PredicateMatches { predicate, pattern } => {
            let re = regex::Regex::new(pattern).ok();
            match (re, text_of(predicate)) {
                (Some(re), Some(text)) => re.is_match(&text),
                _ => false,
            }
        }
        Filter::PredicateLessThan { predicate, value } => {
            matches!(int_of(predicate), Some(v) if v < *value)
        }
        Filter::SubjectMatches(pattern) => regex::Regex::new(pattern)
            .map(|re| re.is_match(subject.as_str()))
            .unwrap_or(false),
        Filter::And(filters) => filters
            .iter()
            .all(|f| matches(f, subject, predicates, text_of, int_of)),
        Filter::Or(filters) => filters
            .iter()
            .any(|f| matches(f, subject, predicates, text_of, int_of)),
    }
}
