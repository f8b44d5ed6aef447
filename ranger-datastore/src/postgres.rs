//! PostgreSQL-backed datastore.
//!
//! Grounded on `batcher::storage::postgres::PostgresStorage`: a `PgPool`,
//! atomic claims via `SELECT ... FOR UPDATE SKIP LOCKED`, and a conditional
//! version-column write for the optimistic transaction lock described in
//! §4.1's implementation hint.

use crate::error::{DatastoreError, Result};
use crate::query::{self, Filter};
use crate::{Datastore, Transaction};
use async_trait::async_trait;
use ranger_proto::{AttrValue, ReadMode, Subject};
use sqlx::{postgres::PgPool, Row};
use std::collections::HashMap;

#[derive(Clone)]
pub struct PostgresDatastore {
    pool: PgPool,
}

impl PostgresDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatastoreError::Backend(format!("migration failed: {e}")))
    }
}

#[async_trait]
impl Datastore for PostgresDatastore {
    async fn set(
        &self,
        subject: &Subject,
        predicate: &str,
        value: Vec<u8>,
        ts: Option<i64>,
        replace: bool,
    ) -> Result<()> {
        let ts = ts.unwrap_or_else(|| chrono::Utc::now().timestamp_micros());
        let mut txn = self.pool.begin().await?;
        if replace {
            sqlx::query("DELETE FROM datastore_attrs WHERE subject = $1 AND predicate = $2")
                .bind(subject.as_str())
                .bind(predicate)
                .execute(&mut *txn)
                .await?;
        }
        sqlx::query(
            "INSERT INTO datastore_attrs (subject, predicate, value, timestamp_us)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (subject, predicate, timestamp_us) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(subject.as_str())
        .bind(predicate)
        .bind(value)
        .bind(ts)
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn multi_set(
        &self,
        subject: &Subject,
        writes: HashMap<String, Vec<(Vec<u8>, Option<i64>)>>,
        to_delete: Vec<String>,
    ) -> Result<()> {
        let mut txn = self.pool.begin().await?;
        for predicate in &to_delete {
            sqlx::query("DELETE FROM datastore_attrs WHERE subject = $1 AND predicate = $2")
                .bind(subject.as_str())
                .bind(predicate)
                .execute(&mut *txn)
                .await?;
        }
        for (predicate, versions) in writes {
            sqlx::query("DELETE FROM datastore_attrs WHERE subject = $1 AND predicate = $2")
                .bind(subject.as_str())
                .bind(&predicate)
                .execute(&mut *txn)
                .await?;
            for (value, ts) in versions {
                let ts = ts.unwrap_or_else(|| chrono::Utc::now().timestamp_micros());
                sqlx::query(
                    "INSERT INTO datastore_attrs (subject, predicate, value, timestamp_us)
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(subject.as_str())
                .bind(&predicate)
                .bind(value)
                .bind(ts)
                .execute(&mut *txn)
                .await?;
            }
        }
        txn.commit().await?;
        Ok(())
    }

    async fn resolve(&self, subject: &Subject, predicate: &str) -> Result<Option<AttrValue>> {
        let row = sqlx::query(
            "SELECT value, timestamp_us FROM datastore_attrs
             WHERE subject = $1 AND predicate = $2
             ORDER BY timestamp_us DESC LIMIT 1",
        )
        .bind(subject.as_str())
        .bind(predicate)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AttrValue::new(predicate, r.get::<Vec<u8>, _>("value"), r.get("timestamp_us"))))
    }

    async fn resolve_regex(
        &self,
        subject: &Subject,
        predicate_regex: &str,
        mode: ReadMode,
        limit: Option<usize>,
    ) -> Result<Vec<AttrValue>> {
        let rows = sqlx::query(
            "SELECT predicate, value, timestamp_us FROM datastore_attrs
             WHERE subject = $1 AND predicate ~ $2
             ORDER BY predicate, timestamp_us",
        )
        .bind(subject.as_str())
        .bind(predicate_regex)
        .fetch_all(&self.pool)
        .await?;

        let mut by_predicate: HashMap<String, Vec<AttrValue>> = HashMap::new();
        for row in rows {
            let predicate: String = row.get("predicate");
            let value: Vec<u8> = row.get("value");
            let ts: i64 = row.get("timestamp_us");
            by_predicate
                .entry(predicate.clone())
                .or_default()
                .push(AttrValue::new(predicate, value, ts));
        }

        let mut out = Vec::new();
        for (_, versions) in by_predicate {
            match mode {
                ReadMode::Newest => {
                    if let Some(v) = versions.into_iter().max_by_key(|v| v.timestamp_us) {
                        out.push(v);
                    }
                }
                ReadMode::All | ReadMode::Range { .. } => {
                    out.extend(versions.into_iter().filter(|v| mode.matches(v.timestamp_us)));
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
        sqlx::query("DELETE FROM datastore_attrs WHERE subject = $1")
            .bind(subject.as_str())
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM datastore_locks WHERE subject = $1")
            .bind(subject.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_attributes(&self, subject: &Subject, predicates: &[String]) -> Result<()> {
        for predicate in predicates {
            sqlx::query("DELETE FROM datastore_attrs WHERE subject = $1 AND predicate = $2")
                .bind(subject.as_str())
                .bind(predicate)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn begin_transaction(&self, subject: &Subject) -> Result<Transaction> {
        sqlx::query(
            "INSERT INTO datastore_locks (subject, lock_version) VALUES ($1, 0)
             ON CONFLICT (subject) DO NOTHING",
        )
        .bind(subject.as_str())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT lock_version FROM datastore_locks WHERE subject = $1")
            .bind(subject.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(Transaction {
            subject: subject.clone(),
            observed_lock: row.get::<i64, _>("lock_version") as u64,
            sets: Vec::new(),
            deletes: Vec::new(),
        })
    }

    async fn commit(&self, txn: Transaction) -> Result<()> {
        let mut db_txn = self.pool.begin().await?;

        // Conditional lock bump: this UPDATE only matches a row if no other
        // committer has already bumped it past what we observed (§4.1, §5).
        let updated = sqlx::query(
            "UPDATE datastore_locks SET lock_version = lock_version + 1
             WHERE subject = $1 AND lock_version = $2",
        )
        .bind(txn.subject.as_str())
        .bind(txn.observed_lock as i64)
        .execute(&mut *db_txn)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DatastoreError::TransactionConflict(txn.subject));
        }

        for predicate in &txn.deletes {
            sqlx::query("DELETE FROM datastore_attrs WHERE subject = $1 AND predicate = $2")
                .bind(txn.subject.as_str())
                .bind(predicate)
                .execute(&mut *db_txn)
                .await?;
        }

        for (predicate, value, ts, replace) in txn.sets {
            if replace {
                sqlx::query("DELETE FROM datastore_attrs WHERE subject = $1 AND predicate = $2")
                    .bind(txn.subject.as_str())
                    .bind(&predicate)
                    .execute(&mut *db_txn)
                    .await?;
            }
            let ts = ts.unwrap_or_else(|| chrono::Utc::now().timestamp_micros());
            sqlx::query(
                "INSERT INTO datastore_attrs (subject, predicate, value, timestamp_us)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(txn.subject.as_str())
            .bind(&predicate)
            .bind(value)
            .bind(ts)
            .execute(&mut *db_txn)
            .await?;
        }

        db_txn.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        subject_prefix: &str,
        filter: Option<Filter>,
        limit: Option<usize>,
    ) -> Result<Vec<Subject>> {
        let rows = sqlx::query(
            "SELECT DISTINCT subject FROM datastore_attrs
             WHERE subject = $1 OR subject LIKE $2
             ORDER BY subject",
        )
        .bind(subject_prefix)
        .bind(format!("{subject_prefix}/%"))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::new();
        for row in rows {
            let subject = Subject::new(row.get::<String, _>("subject"));
            let keep = match &filter {
                None => true,
                Some(filter) => {
                    let attrs = self
                        .resolve_regex(&subject, ".*", ReadMode::Newest, None)
                        .await?;
                    let predicates: Vec<String> = attrs.iter().map(|a| a.predicate.clone()).collect();
                    query::matches(
                        filter,
                        &subject,
                        &predicates,
                        |p| {
                            attrs
                                .iter()
                                .find(|a| a.predicate == p)
                                .map(|a| String::from_utf8_lossy(&a.value).to_string())
                        },
                        |p| {
                            attrs
                                .iter()
                                .find(|a| a.predicate == p)
                                .and_then(|a| String::from_utf8_lossy(&a.value).parse::<i64>().ok())
                        },
                    )
                }
            };
            if keep {
                out.push(subject);
            }
        }
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}
