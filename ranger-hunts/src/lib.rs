//! Hunt engine (§4.7): lifecycle, client scheduling, and result aggregation.
//!
//! The foreman schedules clients onto a hunt blind to its internals — a
//! dedupe marker on the hunt subject plus an `AddClient` notification. Every-
//! thing from there (the client limit, the rate limiter, launching the child
//! flow with the right sub-limits, and the output-plugin pipeline over its
//! results) lives here, deliberately decoupled from `ranger-foreman` the same
//! way the foreman is decoupled from us.

pub mod plugins;

use chrono::{Duration as ChronoDuration, Utc};
use plugins::PluginRegistry;
use ranger_datastore::Datastore;
use ranger_flows::types::FlowStateRecord;
use ranger_foreman::Foreman;
use ranger_proto::{
    hunt_addclient_queue, hunt_register_queue, hunt_results_queue, hunt_status_queue, ClientResources,
    ClientRuleSet, ForemanAction, ForemanRule, HuntContext, HuntState, OutputPluginDescriptor, ReadMode, SessionId,
    StatusOutcome, Subject,
};
use ranger_queue::{AcceptAll, QueueManager};
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HuntError>;

#[derive(Debug, Error)]
pub enum HuntError {
    #[error("datastore error: {0}")]
    Datastore(#[from] ranger_datastore::DatastoreError),
    #[error("queue error: {0}")]
    Queue(#[from] ranger_queue::QueueError),
    #[error("foreman error: {0}")]
    Foreman(#[from] ranger_foreman::ForemanError),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("hunt `{0}` not found")]
    NotFound(String),
}

/// Parameters for creating a new hunt, grouped because `create` otherwise
/// takes more positional args than a caller could keep straight.
#[derive(Debug, Clone)]
pub struct HuntSpec {
    pub flow_class_name: String,
    pub args: serde_json::Value,
    pub creator: String,
    pub client_limit: u64,
    pub client_rate: f64,
    pub expiry: ChronoDuration,
    pub client_cpu_limit: Option<f64>,
    pub client_network_limit: Option<u64>,
    pub total_cpu_limit: Option<f64>,
    pub total_network_limit: Option<u64>,
    pub output_plugins: Vec<OutputPluginDescriptor>,
}

pub struct HuntEngine {
    datastore: Arc<dyn Datastore>,
    queue: Arc<QueueManager>,
    foreman: Arc<Foreman>,
    worker_queue: String,
    plugins: Arc<PluginRegistry>,
}

impl HuntEngine {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        queue: Arc<QueueManager>,
        foreman: Arc<Foreman>,
        worker_queue: impl Into<String>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            datastore,
            queue,
            foreman,
            worker_queue: worker_queue.into(),
            plugins,
        }
    }

    async fn load(&self, hunt_id: &str) -> Result<HuntContext> {
        let subject = Subject::hunt(hunt_id);
        let attr = self
            .datastore
            .resolve(&subject, "context")
            .await?
            .ok_or_else(|| HuntError::NotFound(hunt_id.to_string()))?;
        Ok(serde_json::from_slice(&attr.value)?)
    }

    async fn save(&self, ctx: &HuntContext) -> Result<()> {
        let subject = Subject::hunt(&ctx.hunt_id);
        self.datastore.set(&subject, "context", serde_json::to_vec(ctx)?, None, true).await?;
        Ok(())
    }

    /// Create a new, paused hunt (§4.7 "hunts are created Paused, with no
    /// foreman rule installed until `run`").
    #[tracing::instrument(skip(self, spec))]
    pub async fn create(&self, spec: HuntSpec) -> Result<String> {
        let hunt_id = SessionId::new_hunt().as_str().to_string();
        let mut ctx = HuntContext::new(
            hunt_id.clone(),
            spec.flow_class_name,
            spec.args,
            spec.creator,
            Utc::now(),
            spec.expiry,
            spec.client_limit,
            spec.client_rate,
        );
        ctx.client_cpu_limit = spec.client_cpu_limit;
        ctx.client_network_limit = spec.client_network_limit;
        ctx.total_cpu_limit = spec.total_cpu_limit;
        ctx.total_network_limit = spec.total_network_limit;
        ctx.output_plugins = spec.output_plugins;
        self.save(&ctx).await?;
        Ok(hunt_id)
    }

    /// Start a paused hunt: install its foreman rule and flip it to Started
    /// (§4.7 "Run").
    #[tracing::instrument(skip(self, client_rule_set))]
    pub async fn run(&self, hunt_id: &str, client_rule_set: ClientRuleSet) -> Result<()> {
        let mut ctx = self.load(hunt_id).await?;
        let rule = ForemanRule {
            created: Utc::now(),
            expires: ctx.expires,
            description: format!("hunt {}", ctx.hunt_id),
            client_rule_set,
            actions: vec![ForemanAction {
                hunt_id: ctx.hunt_id.clone(),
                client_limit: Some(ctx.client_limit),
            }],
        };
        self.foreman.install_rule(rule).await?;
        ctx.state = HuntState::Started;
        self.save(&ctx).await?;
        Ok(())
    }

    /// Stop a hunt: remove its foreman rule so no new client is ever
    /// matched, then tag every still-running child with `pending_termination`
    /// so the worker aborts it on its next tick rather than continuing to
    /// run (§4.7 "Stop", §8 invariant #7).
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self, hunt_id: &str, reason: impl Into<String> + Send) -> Result<()> {
        let mut ctx = self.load(hunt_id).await?;
        self.foreman.remove_rules_for_hunt(hunt_id).await?;
        let reason = reason.into();

        let hunt_subject = Subject::hunt(hunt_id);
        let children = self
            .datastore
            .resolve_regex(&hunt_subject, "^child:", ReadMode::Newest, None)
            .await?;
        for attr in children {
            if let Some(child_id) = attr.predicate.strip_prefix("child:") {
                self.tag_pending_termination(child_id, &reason).await?;
            }
        }

        ctx.state = HuntState::Completed;
        self.save(&ctx).await?;
        Ok(())
    }

    async fn tag_pending_termination(&self, child_id: &str, reason: &str) -> Result<()> {
        let subject = Subject::flow(child_id);
        let mut txn = self.datastore.begin_transaction(&subject).await?;
        let Some(attr) = self.datastore.resolve(&subject, "task:state").await? else {
            self.datastore.commit(txn).await?;
            return Ok(());
        };
        let mut state: FlowStateRecord = serde_json::from_slice(&attr.value)?;
        if state.lifecycle.is_terminal() {
            self.datastore.commit(txn).await?;
            return Ok(());
        }
        state.pending_termination = Some(reason.to_string());
        txn.stage_set("task:state", serde_json::to_vec(&state)?, None, true);
        self.datastore.commit(txn).await?;
        self.queue.queue_notification(&self.worker_queue, child_id, Utc::now(), 0).await?;
        Ok(())
    }

    /// Drain `hunt_addclient_queue(hunt_id)`: enforce the client limit, then
    /// either register the client now (unrated) or hand it to the rate
    /// limiter (§4.7 "client_rate", §8 invariants #4 and #5).
    #[tracing::instrument(skip(self))]
    pub async fn process_add_client_queue(&self, hunt_id: &str, batch_size: usize) -> Result<usize> {
        let queue_name = hunt_addclient_queue(hunt_id);
        let claims = self
            .queue
            .claim_notifications(&queue_name, ChronoDuration::seconds(60), &AcceptAll, batch_size)
            .await?;
        if claims.is_empty() {
            return Ok(0);
        }

        let mut ctx = self.load(hunt_id).await?;
        let mut processed = Vec::with_capacity(claims.len());

        for claim in &claims {
            processed.push(claim.record_id.clone());

            if ctx.state != HuntState::Started {
                continue;
            }
            if ctx.is_expired(Utc::now()) || ctx.client_limit_reached() {
                ctx.state = HuntState::Completed;
                self.foreman.remove_rules_for_hunt(hunt_id).await?;
                continue;
            }

            ctx.clients_queued_count += 1;

            if ctx.client_rate > 0.0 {
                let now = Utc::now();
                let due = ctx.next_client_due.max(now);
                ctx.next_client_due = due + ChronoDuration::milliseconds((60_000.0 / ctx.client_rate) as i64);
                self.queue
                    .queue_notification(&hunt_register_queue(hunt_id), &claim.session_id, due, 0)
                    .await?;
            } else {
                self.register_client(&mut ctx, &claim.session_id).await?;
            }
        }

        self.save(&ctx).await?;
        self.queue.delete_notifications(&queue_name, &processed).await?;
        Ok(processed.len())
    }

    /// Drain `hunt_register_queue(hunt_id)` for clients whose rate-limited
    /// delay has elapsed and actually start their child flow.
    #[tracing::instrument(skip(self))]
    pub async fn process_register_queue(&self, hunt_id: &str, batch_size: usize) -> Result<usize> {
        let queue_name = hunt_register_queue(hunt_id);
        let claims = self
            .queue
            .claim_notifications(&queue_name, ChronoDuration::seconds(60), &AcceptAll, batch_size)
            .await?;
        if claims.is_empty() {
            return Ok(0);
        }

        let mut ctx = self.load(hunt_id).await?;
        let mut processed = Vec::with_capacity(claims.len());
        for claim in &claims {
            if ctx.state == HuntState::Started && ctx.is_expired(Utc::now()) {
                ctx.state = HuntState::Completed;
                self.foreman.remove_rules_for_hunt(hunt_id).await?;
            }
            if ctx.state == HuntState::Started {
                self.register_client(&mut ctx, &claim.session_id).await?;
            }
            processed.push(claim.record_id.clone());
        }

        self.save(&ctx).await?;
        self.queue.delete_notifications(&queue_name, &processed).await?;
        Ok(processed.len())
    }

    /// Launch `client_id`'s child flow under this hunt, with CPU/network
    /// sub-limits capped by whatever's left of the hunt's total budget
    /// (§4.7 "Child flow launch").
    async fn register_client(&self, ctx: &mut HuntContext, client_id: &str) -> Result<()> {
        let hunt_subject = Subject::hunt(&ctx.hunt_id);
        let marker = format!("child:{client_id}");
        if self.datastore.resolve(&hunt_subject, &marker).await?.is_some() {
            return Ok(());
        }

        let child_id = SessionId::new_flow("F");
        let child_state = FlowStateRecord::new(
            child_id.as_str().to_string(),
            ctx.flow_class_name.clone(),
            ctx.creator.clone(),
            ctx.args.clone(),
            Some(client_id.to_string()),
            Some(ctx.hunt_id.clone()),
            ctx.child_cpu_limit(ctx.client_cpu_limit),
            ctx.child_network_limit(ctx.client_network_limit),
        );
        let child_subject = Subject::flow(child_id.as_str());
        self.datastore
            .set(&child_subject, "task:state", serde_json::to_vec(&child_state)?, None, true)
            .await?;
        self.datastore
            .set(&hunt_subject, &marker, child_id.as_str().as_bytes().to_vec(), None, true)
            .await?;
        self.queue
            .queue_notification(&self.worker_queue, child_id.as_str(), Utc::now(), 0)
            .await?;
        Ok(())
    }

    /// Drain `hunt_status_queue(hunt_id)`: children report termination here
    /// whether or not they ever sent a result, so `completed_clients_count`
    /// and cumulative resource usage stay accurate even for clients that
    /// errored out before producing anything (§4.7, §8 invariant #9).
    #[tracing::instrument(skip(self))]
    pub async fn process_status_queue(&self, hunt_id: &str, batch_size: usize) -> Result<usize> {
        let queue_name = hunt_status_queue(hunt_id);
        let claims = self
            .queue
            .claim_notifications(&queue_name, ChronoDuration::seconds(60), &AcceptAll, batch_size)
            .await?;
        if claims.is_empty() {
            return Ok(0);
        }

        let hunt_subject = Subject::hunt(hunt_id);
        let statuses = self
            .datastore
            .resolve_regex(&hunt_subject, "^pending_status:", ReadMode::Newest, None)
            .await?;
        let mut ctx = self.load(hunt_id).await?;
        let mut consumed = Vec::with_capacity(statuses.len());
        for attr in statuses {
            let Ok(status) = serde_json::from_slice::<StatusOutcome>(&attr.value) else {
                continue;
            };
            ctx.completed_clients_count += 1;
            ctx.client_resources.add(ClientResources {
                cpu_usage: status.cpu_time_used,
                network_bytes_sent: status.network_bytes_sent,
            });
            consumed.push(attr.predicate);
        }
        self.save(&ctx).await?;
        if !consumed.is_empty() {
            self.datastore.delete_attributes(&hunt_subject, &consumed).await?;
        }
        self.enforce_average_limits(hunt_id, &ctx).await?;

        let record_ids: Vec<String> = claims.iter().map(|claim| claim.record_id.clone()).collect();
        self.queue.delete_notifications(&queue_name, &record_ids).await?;
        Ok(record_ids.len())
    }

    /// Stop the hunt if any configured average-per-client limit (CPU,
    /// network bytes, result count) has been breached (§4.7 "Result
    /// aggregation ... check average-per-client limits").
    async fn enforce_average_limits(&self, hunt_id: &str, ctx: &HuntContext) -> Result<()> {
        if ctx.state != HuntState::Started || ctx.completed_clients_count == 0 {
            return Ok(());
        }
        let completed = ctx.completed_clients_count as f64;
        let cpu_breached = ctx
            .avg_cpu_limit
            .is_some_and(|limit| ctx.client_resources.cpu_usage / completed > limit);
        let network_breached = ctx.avg_network_limit.is_some_and(|limit| {
            ctx.client_resources.network_bytes_sent / ctx.completed_clients_count > limit
        });
        let results_breached = ctx
            .avg_results_limit
            .is_some_and(|limit| ctx.results_count / ctx.completed_clients_count > limit);

        if cpu_breached || network_breached || results_breached {
            self.stop(hunt_id, "average per-client limit exceeded").await?;
        }
        Ok(())
    }

    /// Drain `hunt_results_queue(hunt_id)` through the output-plugin
    /// pipeline (§4.7 "Output plugins").
    #[tracing::instrument(skip(self))]
    pub async fn process_results_queue(&self, hunt_id: &str, batch_size: usize) -> Result<usize> {
        let queue_name = hunt_results_queue(hunt_id);
        let claims = self
            .queue
            .claim_notifications(&queue_name, ChronoDuration::seconds(120), &AcceptAll, batch_size)
            .await?;
        if claims.is_empty() {
            return Ok(0);
        }

        let mut ctx = self.load(hunt_id).await?;
        // `run_pipeline` only reports records newly tallied since the last
        // call (tracked on `ctx.results_tally_mark`), so a plugin still
        // blocking garbage collection never causes the same undeleted
        // records to be counted twice here.
        let summary = plugins::run_pipeline(self.datastore.as_ref(), self.plugins.as_ref(), &mut ctx).await?;
        ctx.results_count += summary.results_processed as u64;
        ctx.clients_with_results_count += summary.distinct_clients as u64;
        self.save(&ctx).await?;
        self.enforce_average_limits(hunt_id, &ctx).await?;

        let record_ids: Vec<String> = claims.iter().map(|claim| claim.record_id.clone()).collect();
        self.queue.delete_notifications(&queue_name, &record_ids).await?;
        Ok(record_ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugins::OutputPlugin;
    use ranger_datastore::in_memory::InMemoryDatastore;
    use ranger_proto::{ClientRuleClause, FlowLifecycle, TypedPayload};

    struct CountingPlugin {
        calls: parking_lot::Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl OutputPlugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }

        async fn process_responses(&self, _responses: &[TypedPayload]) -> std::result::Result<(), String> {
            *self.calls.lock() += 1;
            Ok(())
        }
    }

    fn engine() -> (HuntEngine, Arc<InMemoryDatastore>, Arc<CountingPlugin>) {
        let ds = Arc::new(InMemoryDatastore::new());
        let qm = Arc::new(QueueManager::new(ds.clone()));
        let foreman = Arc::new(Foreman::new(ds.clone(), qm.clone()));
        let plugin = Arc::new(CountingPlugin { calls: parking_lot::Mutex::new(0) });
        let registry = Arc::new(PluginRegistry::new(vec![plugin.clone()]));
        (HuntEngine::new(ds.clone(), qm, foreman, "W", registry), ds, plugin)
    }

    fn spec(client_limit: u64, client_rate: f64) -> HuntSpec {
        HuntSpec {
            flow_class_name: "Noop".to_string(),
            args: serde_json::json!({}),
            creator: "tester".to_string(),
            client_limit,
            client_rate,
            expiry: ChronoDuration::seconds(1000),
            client_cpu_limit: None,
            client_network_limit: None,
            total_cpu_limit: None,
            total_network_limit: None,
            output_plugins: vec![OutputPluginDescriptor {
                plugin_name: "counting".to_string(),
                args: serde_json::json!({}),
            }],
        }
    }

    #[tokio::test]
    async fn client_limit_caps_registered_children_and_pauses_the_hunt() {
        let (engine, ds, _) = engine();
        let hunt_id = engine.create(spec(5, 0.0)).await.unwrap();
        engine
            .run(&hunt_id, ClientRuleSet { clauses: vec![ClientRuleClause::Os { allowed: vec!["linux".to_string()] }] })
            .await
            .unwrap();

        let qm = QueueManager::new(ds.clone());
        for i in 0..10 {
            qm.queue_notification(&hunt_addclient_queue(&hunt_id), &format!("C.{i}"), Utc::now(), 0)
                .await
                .unwrap();
        }

        engine.process_add_client_queue(&hunt_id, 20).await.unwrap();

        let hunt_subject = Subject::hunt(&hunt_id);
        let children = ds
            .resolve_regex(&hunt_subject, "^child:", ReadMode::Newest, None)
            .await
            .unwrap();
        assert_eq!(children.len(), 5, "exactly client_limit children must ever be registered");

        let ctx = engine.load(&hunt_id).await.unwrap();
        assert_eq!(ctx.state, HuntState::Completed, "hitting the client limit must pause/complete the hunt");

        let rules = ds.resolve(&Subject::foreman(), "RULES").await.unwrap().unwrap();
        let rules: Vec<ForemanRule> = serde_json::from_slice(&rules.value).unwrap();
        assert!(rules.is_empty(), "the foreman rule must be removed once the limit is hit");
    }

    #[tokio::test]
    async fn expired_hunt_starts_no_post_expiry_clients() {
        let (engine, ds, _) = engine();
        let mut s = spec(100, 0.0);
        // Already expired by the time any AddClient notification is drained.
        s.expiry = ChronoDuration::milliseconds(-1);
        let hunt_id = engine.create(s).await.unwrap();
        engine.run(&hunt_id, ClientRuleSet { clauses: vec![] }).await.unwrap();

        let qm = QueueManager::new(ds.clone());
        qm.queue_notification(&hunt_addclient_queue(&hunt_id), "C.late", Utc::now(), 0)
            .await
            .unwrap();
        engine.process_add_client_queue(&hunt_id, 10).await.unwrap();

        let children = ds
            .resolve_regex(&Subject::hunt(&hunt_id), "^child:", ReadMode::Newest, None)
            .await
            .unwrap();
        assert!(children.is_empty(), "a client arriving after the hunt has expired must never be registered");

        let ctx = engine.load(&hunt_id).await.unwrap();
        assert_eq!(ctx.state, HuntState::Completed);
    }

    #[tokio::test]
    async fn stop_tags_running_children_and_spares_terminated_ones() {
        let (engine, ds, _) = engine();
        let hunt_id = engine.create(spec(10, 0.0)).await.unwrap();
        engine.run(&hunt_id, ClientRuleSet { clauses: vec![] }).await.unwrap();

        let qm = QueueManager::new(ds.clone());
        qm.queue_notification(&hunt_addclient_queue(&hunt_id), "C.1", Utc::now(), 0).await.unwrap();
        qm.queue_notification(&hunt_addclient_queue(&hunt_id), "C.2", Utc::now(), 0).await.unwrap();
        engine.process_add_client_queue(&hunt_id, 10).await.unwrap();

        let children = ds
            .resolve_regex(&Subject::hunt(&hunt_id), "^child:", ReadMode::Newest, None)
            .await
            .unwrap();
        assert_eq!(children.len(), 2);
        let child_ids: Vec<String> = children
            .iter()
            .map(|attr| String::from_utf8(attr.value.clone()).unwrap())
            .collect();

        // Mark one child already terminated before Stop runs.
        let done_subject = Subject::flow(&child_ids[0]);
        let attr = ds.resolve(&done_subject, "task:state").await.unwrap().unwrap();
        let mut done_state: FlowStateRecord = serde_json::from_slice(&attr.value).unwrap();
        done_state.lifecycle = FlowLifecycle::Terminated;
        ds.set(&done_subject, "task:state", serde_json::to_vec(&done_state).unwrap(), None, true)
            .await
            .unwrap();

        engine.stop(&hunt_id, "operator stop").await.unwrap();

        let running_attr = ds.resolve(&Subject::flow(&child_ids[1]), "task:state").await.unwrap().unwrap();
        let running_state: FlowStateRecord = serde_json::from_slice(&running_attr.value).unwrap();
        assert_eq!(running_state.pending_termination.as_deref(), Some("operator stop"));

        let done_attr = ds.resolve(&done_subject, "task:state").await.unwrap().unwrap();
        let done_state: FlowStateRecord = serde_json::from_slice(&done_attr.value).unwrap();
        assert!(done_state.pending_termination.is_none(), "an already-terminated child must not be retagged");
    }

    #[tokio::test]
    async fn breaching_average_cpu_limit_stops_the_hunt() {
        let (engine, ds, _) = engine();
        let hunt_id = engine.create(spec(10, 0.0)).await.unwrap();
        engine.run(&hunt_id, ClientRuleSet { clauses: vec![] }).await.unwrap();

        let mut ctx = engine.load(&hunt_id).await.unwrap();
        ctx.avg_cpu_limit = Some(5.0);
        engine.save(&ctx).await.unwrap();

        let qm = QueueManager::new(ds.clone());
        qm.queue_notification(&hunt_addclient_queue(&hunt_id), "C.1", Utc::now(), 0).await.unwrap();
        engine.process_add_client_queue(&hunt_id, 10).await.unwrap();

        let hunt_subject = Subject::hunt(&hunt_id);
        let status = StatusOutcome { response_id: 1, ok: true, backtrace: None, cpu_time_used: 9.0, network_bytes_sent: 0 };
        ds.set(&hunt_subject, "pending_status:00000000000000000001:first", serde_json::to_vec(&status).unwrap(), Some(1), false)
            .await
            .unwrap();
        qm.queue_notification(&hunt_status_queue(&hunt_id), "first", Utc::now(), 0)
            .await
            .unwrap();

        engine.process_status_queue(&hunt_id, 10).await.unwrap();

        let ctx = engine.load(&hunt_id).await.unwrap();
        assert_eq!(ctx.state, HuntState::Completed, "breaching the average CPU limit must stop the hunt");
        assert_eq!(ctx.completed_clients_count, 1);

        let rules = ds.resolve(&Subject::foreman(), "RULES").await.unwrap().unwrap();
        let rules: Vec<ForemanRule> = serde_json::from_slice(&rules.value).unwrap();
        assert!(rules.is_empty(), "breaching the average limit must also remove the foreman rule");
    }

    #[tokio::test]
    async fn a_rate_limited_hunt_staggers_registration_instead_of_admitting_everyone_at_once() {
        let (engine, ds, _) = engine();
        // 2/minute: the second client's due time lands 30s after the first.
        let hunt_id = engine.create(spec(10, 2.0)).await.unwrap();
        engine.run(&hunt_id, ClientRuleSet { clauses: vec![] }).await.unwrap();

        let qm = QueueManager::new(ds.clone());
        qm.queue_notification(&hunt_addclient_queue(&hunt_id), "C.1", Utc::now(), 0).await.unwrap();
        qm.queue_notification(&hunt_addclient_queue(&hunt_id), "C.2", Utc::now(), 0).await.unwrap();
        engine.process_add_client_queue(&hunt_id, 10).await.unwrap();

        let hunt_subject = Subject::hunt(&hunt_id);
        let children = ds.resolve_regex(&hunt_subject, "^child:", ReadMode::Newest, None).await.unwrap();
        assert!(children.is_empty(), "rate-limited clients must not be registered directly off the add-client queue");

        // Only the first client's due time has elapsed; the second is still
        // 30s out and must not be claimable yet.
        let registered = engine.process_register_queue(&hunt_id, 10).await.unwrap();
        assert_eq!(registered, 1, "exactly one client's rate-limited delay has elapsed so far");

        let children = ds.resolve_regex(&hunt_subject, "^child:", ReadMode::Newest, None).await.unwrap();
        assert_eq!(children.len(), 1, "only the due client should have a child flow");

        let ctx = engine.load(&hunt_id).await.unwrap();
        assert_eq!(ctx.clients_queued_count, 2, "both clients were admitted past the client limit check");
    }
}
