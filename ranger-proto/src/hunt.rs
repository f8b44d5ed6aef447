//! Hunt state (§3 "HuntContext"): a superset of flow state.

use crate::ClientResources;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HuntState {
    Paused,
    Started,
    Completed,
}

/// Rolling CPU/network histograms and top-N worst performers (§3 "usage_stats").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub cpu_histogram: Vec<f64>,
    pub network_histogram: Vec<u64>,
    /// `(client_id, cpu_usage)` pairs, worst performers first.
    pub worst_performers: Vec<(String, f64)>,
}

impl UsageStats {
    const TOP_N: usize = 10;

    pub fn record(&mut self, client_id: &str, resources: ClientResources) {
        self.cpu_histogram.push(resources.cpu_usage);
        self.network_histogram.push(resources.network_bytes_sent);
        self.worst_performers
            .push((client_id.to_string(), resources.cpu_usage));
        self.worst_performers
            .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        self.worst_performers.truncate(Self::TOP_N);
    }
}

/// Per-hunt persisted state (§3 "HuntContext").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntContext {
    pub hunt_id: String,
    pub flow_class_name: String,
    pub args: serde_json::Value,
    pub creator: String,
    pub create_time: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub state: HuntState,

    pub client_limit: u64,
    pub client_rate: f64,
    /// Rate-limiting cursor: the earliest instant the next client may start.
    pub next_client_due: DateTime<Utc>,

    /// Per-child CPU/network limit before the hunt's total budget is applied
    /// (the `flow_limit` argument to `child_cpu_limit`/`child_network_limit`).
    pub client_cpu_limit: Option<f64>,
    pub client_network_limit: Option<u64>,

    pub clients_queued_count: u64,
    pub completed_clients_count: u64,
    pub clients_with_results_count: u64,
    pub results_count: u64,

    pub client_resources: ClientResources,
    pub usage_stats: UsageStats,

    pub avg_cpu_limit: Option<f64>,
    pub avg_network_limit: Option<u64>,
    pub avg_results_limit: Option<u64>,

    /// Total CPU/network budget for the whole hunt (§4.7 "Child flow
    /// launch": each child's sub-limit is `min(flow_limit, hunt_total_limit
    /// - hunt_consumed)`). `None` means unbounded.
    pub total_cpu_limit: Option<f64>,
    pub total_network_limit: Option<u64>,

    pub pending_termination: Option<String>,

    pub output_plugins: Vec<OutputPluginDescriptor>,
    /// High-water mark: the last result-queue record id each output plugin
    /// has successfully consumed (§4.7 "state records a high-water mark").
    pub plugin_high_water_marks: HashMap<String, u64>,
    /// How many of the current `pending_result:` records (counting from the
    /// oldest undeleted) have already been credited to `results_count` and
    /// `clients_with_results_count`. Rebased alongside
    /// `plugin_high_water_marks` whenever garbage collection deletes a
    /// prefix, so a pipeline pass that can't yet garbage-collect never
    /// re-tallies records it already counted.
    pub results_tally_mark: u64,
}

impl HuntContext {
    pub fn new(
        hunt_id: String,
        flow_class_name: String,
        args: serde_json::Value,
        creator: String,
        now: DateTime<Utc>,
        expiry: chrono::Duration,
        client_limit: u64,
        client_rate: f64,
    ) -> Self {
        Self {
            hunt_id,
            flow_class_name,
            args,
            creator,
            create_time: now,
            expires: now + expiry,
            state: HuntState::Paused,
            client_limit,
            client_rate,
            next_client_due: now,
            client_cpu_limit: None,
            client_network_limit: None,
            clients_queued_count: 0,
            completed_clients_count: 0,
            clients_with_results_count: 0,
            results_count: 0,
            client_resources: ClientResources::default(),
            usage_stats: UsageStats::default(),
            avg_cpu_limit: None,
            avg_network_limit: None,
            avg_results_limit: None,
            total_cpu_limit: None,
            total_network_limit: None,
            pending_termination: None,
            output_plugins: Vec::new(),
            plugin_high_water_marks: HashMap::new(),
            results_tally_mark: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires
    }

    pub fn client_limit_reached(&self) -> bool {
        self.client_limit > 0 && self.clients_queued_count >= self.client_limit
    }

    /// Sub-limit handed to the next child flow: the smaller of the flow's
    /// own requested limit and whatever's left of the hunt's total budget.
    pub fn child_cpu_limit(&self, flow_limit: Option<f64>) -> Option<f64> {
        let remaining = self.total_cpu_limit.map(|total| (total - self.client_resources.cpu_usage).max(0.0));
        match (flow_limit, remaining) {
            (Some(f), Some(r)) => Some(f.min(r)),
            (Some(f), None) => Some(f),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        }
    }

    pub fn child_network_limit(&self, flow_limit: Option<u64>) -> Option<u64> {
        let remaining = self
            .total_network_limit
            .map(|total| total.saturating_sub(self.client_resources.network_bytes_sent));
        match (flow_limit, remaining) {
            (Some(f), Some(r)) => Some(f.min(r)),
            (Some(f), None) => Some(f),
            (None, Some(r)) => Some(r),
            (None, None) => None,
        }
    }
}

/// Queue a hunt's children publish `SendReply` results onto, and its
/// "add this client" scheduling queue (§4.7). Shared naming so
/// `ranger-flows` (which writes results) and `ranger-hunts` (which reads
/// them) agree without a circular crate dependency.
pub fn hunt_results_queue(hunt_id: &str) -> String {
    format!("huntresults:{hunt_id}")
}

pub fn hunt_addclient_queue(hunt_id: &str) -> String {
    format!("addclient:{hunt_id}")
}

/// Queue a hunt's child flows notify on termination, independent of whether
/// they ever produced a result (§4.7 `completed_clients_count`).
pub fn hunt_status_queue(hunt_id: &str) -> String {
    format!("huntstatus:{hunt_id}")
}

/// Rate-limited registration queue: an `AddClient` that can't start yet waits
/// here until its `eligible_after` comes due (§4.7 "client_rate").
pub fn hunt_register_queue(hunt_id: &str) -> String {
    format!("huntregister:{hunt_id}")
}

/// An ordered output plugin entry on a hunt (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPluginDescriptor {
    pub plugin_name: String,
    pub args: serde_json::Value,
}
