//! The datastore abstraction (§4.1): the only persistent state in the system.
//! Every other component is recoverable by replaying from a conforming store.

pub mod error;
pub mod in_memory;
pub mod query;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{DatastoreError, Result};
pub use query::Filter;

use async_trait::async_trait;
use ranger_proto::{AttrValue, ReadMode, Subject};
use std::collections::HashMap;

/// An optimistic lock scoped to a single subject, returned by
/// `Datastore::begin_transaction` and consumed by `Datastore::commit`.
///
/// Implementation hint followed from §4.1: a `_lock` version attribute is
/// stored on the subject; `commit` writes the staged predicates conditional
/// on the prior `_lock` value, atomically bumping it. A losing commit leaves
/// the subject untouched and returns `TransactionConflict`.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub subject: Subject,
    pub(crate) observed_lock: u64,
    pub(crate) sets: Vec<(String, Vec<u8>, Option<i64>, bool)>,
    pub(crate) deletes: Vec<String>,
}

impl Transaction {
    /// Stage a write inside the transaction; nothing is visible to other
    /// readers until `commit` succeeds.
    pub fn stage_set(&mut self, predicate: impl Into<String>, value: Vec<u8>, ts: Option<i64>, replace: bool) {
        self.sets.push((predicate.into(), value, ts, replace));
    }

    pub fn stage_delete(&mut self, predicate: impl Into<String>) {
        self.deletes.push(predicate.into());
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Append a new timestamped version; if `replace` then older versions of
    /// this predicate are deleted atomically with the write (§4.1 "Set").
    async fn set(
        &self,
        subject: &Subject,
        predicate: &str,
        value: Vec<u8>,
        ts: Option<i64>,
        replace: bool,
    ) -> Result<()>;

    /// Atomic per-subject multi-predicate write (§4.1 "MultiSet").
    async fn multi_set(
        &self,
        subject: &Subject,
        writes: HashMap<String, Vec<(Vec<u8>, Option<i64>)>>,
        to_delete: Vec<String>,
    ) -> Result<()>;

    /// Newest version of a predicate, or `None` (§4.1 "Resolve").
    async fn resolve(&self, subject: &Subject, predicate: &str) -> Result<Option<AttrValue>>;

    /// Predicates matching a regex, filtered by read mode (§4.1 "ResolveRegex").
    async fn resolve_regex(
        &self,
        subject: &Subject,
        predicate_regex: &str,
        mode: ReadMode,
        limit: Option<usize>,
    ) -> Result<Vec<AttrValue>>;

    /// Batched form of `resolve_regex` across many subjects (§4.1 "MultiResolveRegex").
    async fn multi_resolve_regex(
        &self,
        subjects: &[Subject],
        predicate_regex: &str,
        mode: ReadMode,
    ) -> Result<HashMap<Subject, Vec<AttrValue>>>;

    async fn delete_subject(&self, subject: &Subject) -> Result<()>;

    async fn delete_attributes(&self, subject: &Subject, predicates: &[String]) -> Result<()>;

    /// Begin an optimistic, subject-scoped transaction (§4.1 "Transaction").
    async fn begin_transaction(&self, subject: &Subject) -> Result<Transaction>;

    /// Commit a transaction. At most one concurrent committer for the same
    /// subject succeeds; the rest get `TransactionConflict` (§4.1, §5).
    async fn commit(&self, txn: Transaction) -> Result<()>;

    /// Scan subjects under `subject_prefix` matching `filter`, in
    /// deterministic subject order (§4.1 "Query").
    async fn query(
        &self,
        subject_prefix: &str,
        filter: Option<Filter>,
        limit: Option<usize>,
    ) -> Result<Vec<Subject>>;
}
