//! In-memory datastore, suitable for tests and single-process deployments.
//!
//! Grounded on `batcher::storage::in_memory::InMemoryStorage`'s pattern of a
//! `parking_lot::RwLock` over a concurrent map, generalized from one request
//! row per key to the full subject/predicate/multi-version model.

use crate::error::{DatastoreError, Result};
use crate::query::{self, Filter};
use crate::{Datastore, Transaction};
use async_trait::async_trait;
use parking_lot::RwLock;
use ranger_proto::{AttrValue, ReadMode, Subject};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default, Clone)]
struct SubjectRow {
    /// predicate -> versions, newest last.
    attrs: HashMap<String, Vec<AttrValue>>,
    lock: u64,
}

/// In-memory implementation of `Datastore`.
#[derive(Clone, Default)]
pub struct InMemoryDatastore {
    subjects: Arc<RwLock<HashMap<Subject, SubjectRow>>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn now_us() -> i64 {
        chrono::Utc::now().timestamp_micros()
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn set(
        &self,
        subject: &Subject,
        predicate: &str,
        value: Vec<u8>,
        ts: Option<i64>,
        replace: bool,
    ) -> Result<()> {
        let ts = ts.unwrap_or_else(Self::now_us);
        let mut subjects = self.subjects.write();
        let row = subjects.entry(subject.clone()).or_default();
        let versions = row.attrs.entry(predicate.to_string()).or_default();
        if replace {
            versions.clear();
        }
        versions.push(AttrValue::new(predicate, value, ts));
        versions.sort_by_key(|v| v.timestamp_us);
        Ok(())
    }

    async fn multi_set(
        &self,
        subject: &Subject,
        writes: HashMap<String, Vec<(Vec<u8>, Option<i64>)>>,
        to_delete: Vec<String>,
    ) -> Result<()> {
        let mut subjects = self.subjects.write();
        let row = subjects.entry(subject.clone()).or_default();
        for predicate in &to_delete {
            row.attrs.remove(predicate);
        }
        for (predicate, versions) in writes {
            let entry = row.attrs.entry(predicate.clone()).or_default();
            entry.clear();
            for (value, ts) in versions {
                entry.push(AttrValue::new(&predicate, value, ts.unwrap_or_else(Self::now_us)));
            }
            entry.sort_by_key(|v| v.timestamp_us);
        }
        Ok(())
    }

    async fn resolve(&self, subject: &Subject, predicate: &str) -> Result<Option<AttrValue>> {
        let subjects = self.subjects.read();
        Ok(subjects
            .get(subject)
            .and_then(|row| row.attrs.get(predicate))
            .and_then(|versions| versions.last().cloned()))
    }

    async fn resolve_regex(
        &self,
        subject: &Subject,
        predicate_regex: &str,
        mode: ReadMode,
        limit: Option<usize>,
    ) -> Result<Vec<AttrValue>> {
        let re = regex::Regex::new(predicate_regex)
            .map_err(|e| DatastoreError::Backend(format!("bad predicate regex: {e}")))?;
        let subjects = self.subjects.read();
        let Some(row) = subjects.get(subject) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (predicate, versions) in &row.attrs {
            if !re.is_match(predicate) {
                continue;
            }
            match mode {
                ReadMode::Newest => {
                    if let Some(v) = versions.last() {
                        out.push(v.clone());
                    }
                }
                ReadMode::All | ReadMode::Range { .. } => {
                    out.extend(versions.iter().filter(|v| mode.matches(v.timestamp_us)).cloned());
                }
            }
        }
        out.sort_by_key(|v| v.timestamp_us);
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn multi_resolve_regex(
        &self,
        subjects: &[Subject],
        predicate_regex: &str,
        mode: ReadMode,
    ) -> Result<HashMap<Subject, Vec<AttrValue>>> {
        let mut out = HashMap::new();
        for subject in subjects {
            let values = self.resolve_regex(subject, predicate_regex, mode, None).await?;
            if !values.is_empty() {
                out.insert(subject.clone(), values);
            }
        }
        Ok(out)
    }

    async fn delete_subject(&self, subject: &Subject) -> Result<()> {
        self.subjects.write().remove(subject);
        Ok(())
    }

    async fn delete_attributes(&self, subject: &Subject, predicates: &[String]) -> Result<()> {
        let mut subjects = self.subjects.write();
        if let Some(row) = subjects.get_mut(subject) {
            for predicate in predicates {
                row.attrs.remove(predicate);
            }
        }
        Ok(())
    }

    async fn begin_transaction(&self, subject: &Subject) -> Result<Transaction> {
        let subjects = self.subjects.read();
        let observed_lock = subjects.get(subject).map(|r| r.lock).unwrap_or(0);
        Ok(Transaction {
            subject: subject.clone(),
            observed_lock,
            sets: Vec::new(),
            deletes: Vec::new(),
        })
    }

    async fn commit(&self, txn: Transaction) -> Result<()> {
        let mut subjects = self.subjects.write();
        let row = subjects.entry(txn.subject.clone()).or_default();
        if row.lock != txn.observed_lock {
            return Err(DatastoreError::TransactionConflict(txn.subject));
        }
        for predicate in &txn.deletes {
            row.attrs.remove(predicate);
        }
        for (predicate, value, ts, replace) in txn.sets {
            let versions = row.attrs.entry(predicate.clone()).or_default();
            if replace {
                versions.clear();
            }
            versions.push(AttrValue::new(&predicate, value, ts.unwrap_or_else(Self::now_us)));
            versions.sort_by_key(|v| v.timestamp_us);
        }
        row.lock += 1;
        Ok(())
    }

    async fn query(
        &self,
        subject_prefix: &str,
        filter: Option<Filter>,
        limit: Option<usize>,
    ) -> Result<Vec<Subject>> {
        let subjects = self.subjects.read();
        let mut matching: Vec<Subject> = subjects
            .iter()
            .filter(|(subject, _)| subject.starts_with(subject_prefix))
            .filter(|(subject, row)| match &filter {
                None => true,
                Some(filter) => {
                    let predicates: Vec<String> = row.attrs.keys().cloned().collect();
                    query::matches(
                        filter,
                        subject,
                        &predicates,
                        |p| {
                            row.attrs
                                .get(p)
                                .and_then(|v| v.last())
                                .map(|v| String::from_utf8_lossy(&v.value).to_string())
                        },
                        |p| {
                            row.attrs
                                .get(p)
                                .and_then(|v| v.last())
                                .and_then(|v| String::from_utf8_lossy(&v.value).parse::<i64>().ok())
                        },
                    )
                }
            })
            .map(|(subject, _)| subject.clone())
            .collect();
        matching.sort();
        if let Some(limit) = limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}
