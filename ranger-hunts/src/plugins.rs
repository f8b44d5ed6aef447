//! Output-plugin pipeline (§4.7): every registered plugin walks a hunt's
//! `pending_result:` stream independently, tracking its own high-water mark
//! so one plugin's failure never blocks or re-delivers results to another.

use async_trait::async_trait;
use ranger_datastore::{Datastore, DatastoreError};
use ranger_proto::{HuntContext, ReadMode, Subject, TypedPayload};
use std::collections::HashSet;
use std::sync::Arc;

/// A consumer of a hunt's accumulated results. Plugins never see raw
/// datastore predicates, only the decoded payloads a flow's `SendReply`
/// produced.
#[async_trait]
pub trait OutputPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Consume one ordered batch. An `Err` leaves this plugin's high-water
    /// mark untouched, so the same batch is retried on the next pipeline run
    /// without affecting any other plugin's progress (§4.7, §8 invariant #6).
    async fn process_responses(&self, responses: &[TypedPayload]) -> std::result::Result<(), String>;
}

pub struct PluginRegistry {
    plugins: Vec<Arc<dyn OutputPlugin>>,
}

impl PluginRegistry {
    pub fn new(plugins: Vec<Arc<dyn OutputPlugin>>) -> Self {
        Self { plugins }
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn OutputPlugin>> {
        self.plugins.iter().find(|plugin| plugin.name() == name)
    }
}

#[derive(Debug, Default)]
pub struct PipelineSummary {
    pub results_processed: usize,
    pub distinct_clients: usize,
    pub plugin_errors: Vec<(String, String)>,
}

/// Run every plugin configured on `ctx` over whatever `pending_result:`
/// records it hasn't consumed yet, then delete the prefix every plugin has
/// advanced past.
pub async fn run_pipeline(
    datastore: &dyn Datastore,
    registry: &PluginRegistry,
    ctx: &mut HuntContext,
) -> std::result::Result<PipelineSummary, DatastoreError> {
    let hunt_subject = Subject::hunt(&ctx.hunt_id);
    let mut records = datastore
        .resolve_regex(&hunt_subject, "^pending_result:", ReadMode::Newest, None)
        .await?;
    // Predicates embed a zero-padded microsecond timestamp, so lexical order
    // is chronological order.
    records.sort_by(|a, b| a.predicate.cmp(&b.predicate));

    let mut summary = PipelineSummary::default();
    if records.is_empty() || ctx.output_plugins.is_empty() {
        return Ok(summary);
    }

    let mut payloads = Vec::with_capacity(records.len());
    for attr in &records {
        if let Ok(payload) = serde_json::from_slice::<TypedPayload>(&attr.value) {
            payloads.push(payload);
        }
    }

    // Records up to the tally mark were already credited to
    // `results_count`/`clients_with_results_count` on an earlier pass; a
    // plugin still blocking GC must not cause them to be counted again.
    let tally_mark = (ctx.results_tally_mark as usize).min(records.len());
    let new_records = &records[tally_mark..];
    let new_distinct_sessions: HashSet<String> =
        new_records.iter().filter_map(|attr| child_session_from_predicate(&attr.predicate)).collect();
    summary.results_processed = new_records.len();
    summary.distinct_clients = new_distinct_sessions.len();
    ctx.results_tally_mark = records.len() as u64;

    let mut min_advanced = records.len() as u64;
    for descriptor in &ctx.output_plugins {
        let mark = ctx.plugin_high_water_marks.get(&descriptor.plugin_name).copied().unwrap_or(0);
        let advanced = match registry.find(&descriptor.plugin_name) {
            Some(plugin) => {
                let unseen = &payloads[(mark as usize).min(payloads.len())..];
                if unseen.is_empty() {
                    mark
                } else {
                    match plugin.process_responses(unseen).await {
                        Ok(()) => records.len() as u64,
                        Err(message) => {
                            summary.plugin_errors.push((descriptor.plugin_name.clone(), message));
                            mark
                        }
                    }
                }
            }
            // No plugin registered under this name: never advances.
            None => mark,
        };
        ctx.plugin_high_water_marks.insert(descriptor.plugin_name.clone(), advanced);
        min_advanced = min_advanced.min(advanced);
    }

    if min_advanced > 0 {
        let to_delete: Vec<String> = records[..min_advanced as usize]
            .iter()
            .map(|attr| attr.predicate.clone())
            .collect();
        datastore.delete_attributes(&hunt_subject, &to_delete).await?;
        for mark in ctx.plugin_high_water_marks.values_mut() {
            *mark = mark.saturating_sub(min_advanced);
        }
        ctx.results_tally_mark = ctx.results_tally_mark.saturating_sub(min_advanced);
    }

    Ok(summary)
}

/// Pull the child's session id out of a `pending_result:<ts>:<session_id>:<index>`
/// predicate. Split carefully: the session id itself contains a `:` (e.g. `F:abc123`).
fn child_session_from_predicate(predicate: &str) -> Option<String> {
    let rest = predicate.strip_prefix("pending_result:")?;
    let (_, rest) = rest.split_once(':')?;
    let (session_id, _) = rest.rsplit_once(':')?;
    Some(session_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use ranger_datastore::in_memory::InMemoryDatastore;
    use ranger_proto::OutputPluginDescriptor;

    struct Recording {
        name: String,
        calls: Mutex<Vec<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl OutputPlugin for Recording {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process_responses(&self, responses: &[TypedPayload]) -> std::result::Result<(), String> {
            if self.fail {
                return Err("boom".to_string());
            }
            self.calls.lock().push(responses.len());
            Ok(())
        }
    }

    fn ctx_with_plugins(names: &[&str]) -> HuntContext {
        let mut ctx = HuntContext::new(
            "H:test".to_string(),
            "Noop".to_string(),
            serde_json::json!({}),
            "tester".to_string(),
            chrono::Utc::now(),
            chrono::Duration::hours(1),
            0,
            0.0,
        );
        ctx.output_plugins = names
            .iter()
            .map(|name| OutputPluginDescriptor {
                plugin_name: name.to_string(),
                args: serde_json::json!({}),
            })
            .collect();
        ctx
    }

    async fn seed_result(ds: &InMemoryDatastore, hunt_id: &str, session_id: &str, index: u64, ts: i64) {
        let subject = Subject::hunt(hunt_id);
        let predicate = format!("pending_result:{ts:020}:{session_id}:{index}");
        let payload = TypedPayload::new("Stat", &serde_json::json!({"n": index})).unwrap();
        ds.set(&subject, &predicate, serde_json::to_vec(&payload).unwrap(), Some(ts), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn a_failing_plugin_does_not_block_or_lose_results_for_a_healthy_one() {
        let ds = InMemoryDatastore::new();
        seed_result(&ds, "H:test", "F:aaa", 0, 100).await;
        seed_result(&ds, "H:test", "F:bbb", 0, 200).await;

        let failing = Arc::new(Recording { name: "failing".to_string(), calls: Mutex::new(Vec::new()), fail: true });
        let ok = Arc::new(Recording { name: "ok".to_string(), calls: Mutex::new(Vec::new()), fail: false });
        let registry = PluginRegistry::new(vec![failing.clone(), ok.clone()]);

        let mut ctx = ctx_with_plugins(&["failing", "ok"]);
        let summary = run_pipeline(&ds, &registry, &mut ctx).await.unwrap();

        assert_eq!(summary.results_processed, 2);
        assert_eq!(ok.calls.lock().len(), 1, "ok plugin must run exactly once");
        assert_eq!(*ok.calls.lock().first().unwrap(), 2);
        assert_eq!(summary.plugin_errors.len(), 1);

        // GC is bounded by the slowest (failing) plugin: nothing deleted yet.
        let remaining = ds
            .resolve_regex(&Subject::hunt("H:test"), "^pending_result:", ReadMode::Newest, None)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2, "failing plugin must not lose ok's already-processed results");

        // Second run: failing plugin starts succeeding, should see the same batch again.
        let ok_only = PluginRegistry::new(vec![ok.clone()]);
        ctx.output_plugins.retain(|d| d.plugin_name == "ok");
        let _ = run_pipeline(&ds, &ok_only, &mut ctx).await.unwrap();
        let remaining = ds
            .resolve_regex(&Subject::hunt("H:test"), "^pending_result:", ReadMode::Newest, None)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 0, "once only the caught-up plugin remains, GC reclaims the batch");
    }

    #[tokio::test]
    async fn distinct_clients_counts_unique_child_sessions() {
        let ds = InMemoryDatastore::new();
        seed_result(&ds, "H:test", "F:aaa", 0, 100).await;
        seed_result(&ds, "H:test", "F:aaa", 1, 150).await;
        seed_result(&ds, "H:test", "F:bbb", 0, 200).await;

        let ok = Arc::new(Recording { name: "ok".to_string(), calls: Mutex::new(Vec::new()), fail: false });
        let registry = PluginRegistry::new(vec![ok]);
        let mut ctx = ctx_with_plugins(&["ok"]);

        let summary = run_pipeline(&ds, &registry, &mut ctx).await.unwrap();
        assert_eq!(summary.results_processed, 3);
        assert_eq!(summary.distinct_clients, 2);
    }

    #[tokio::test]
    async fn a_blocked_plugin_does_not_cause_already_tallied_records_to_be_recounted() {
        let ds = InMemoryDatastore::new();
        seed_result(&ds, "H:test", "F:aaa", 0, 100).await;
        seed_result(&ds, "H:test", "F:bbb", 0, 200).await;

        let failing = Arc::new(Recording { name: "failing".to_string(), calls: Mutex::new(Vec::new()), fail: true });
        let ok = Arc::new(Recording { name: "ok".to_string(), calls: Mutex::new(Vec::new()), fail: false });
        let registry = PluginRegistry::new(vec![failing.clone(), ok.clone()]);
        let mut ctx = ctx_with_plugins(&["failing", "ok"]);

        let first = run_pipeline(&ds, &registry, &mut ctx).await.unwrap();
        assert_eq!(first.results_processed, 2, "first pass tallies both records");

        // The failing plugin still hasn't advanced, so GC hasn't run and the
        // same two records are seen again on every following pass.
        let second = run_pipeline(&ds, &registry, &mut ctx).await.unwrap();
        assert_eq!(second.results_processed, 0, "records already tallied must not be counted again");
        let third = run_pipeline(&ds, &registry, &mut ctx).await.unwrap();
        assert_eq!(third.results_processed, 0, "still blocked: still nothing new to tally");

        // A new result arrives while GC is still blocked: only it is tallied.
        seed_result(&ds, "H:test", "F:ccc", 0, 300).await;
        let fourth = run_pipeline(&ds, &registry, &mut ctx).await.unwrap();
        assert_eq!(fourth.results_processed, 1, "only the newly arrived record is tallied");

        // Failing plugin catches up: GC reclaims everything and the tally
        // mark rebases with it, so a later arrival is still tallied exactly once.
        let ok_only = PluginRegistry::new(vec![ok.clone()]);
        ctx.output_plugins.retain(|d| d.plugin_name == "ok");
        let _ = run_pipeline(&ds, &ok_only, &mut ctx).await.unwrap();
        seed_result(&ds, "H:test", "F:ddd", 0, 400).await;
        let fifth = run_pipeline(&ds, &ok_only, &mut ctx).await.unwrap();
        assert_eq!(fifth.results_processed, 1, "tally mark rebases correctly once GC catches up");
    }
}
