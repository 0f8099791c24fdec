//! Per-call-site metrics for LLM-backed functions.
//!
//! Every chunk call made by the executor lands here as one [`CallRecord`]. Records are accumulated per call site
//! and exposed through two read-only views:
//!
//! - a flat view keyed by `"{function}_{sequential_id}"`, e.g. `llm_complete_1`
//! - a debug view nested by thread and state, with each leaf carrying the call site's `registration_order`
//!
//! Call sites register lazily on their first record. Sequential ids count per function name and registration
//! order counts across all functions, both within the current epoch. [`MetricsRegistry::reset`] starts a new
//! epoch: all records are dropped at once and numbering restarts at 1, including for call sites that registered
//! before the reset and record again afterwards.
//!
//! The registry holds a single mutex around plain maps. Callers measure provider I/O themselves and only enter the
//! lock to fold the finished numbers in.

mod scope;

pub use scope::{MetricsScope, StateId, current_thread_slot};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Confirmation returned by `flock_reset_metrics`.
pub const RESET_CONFIRMATION: &str = "Metrics reset successfully";

/// Handle identifying one call site. Keys are never reused, even across resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteKey(u64);

/// The numbers produced by one chunk call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Time spent waiting on the provider
    pub api_duration: Duration,
    /// Time spent on the whole chunk: rendering, the provider call and response parsing
    pub execution_time: Duration,
}

/// Accumulated metrics for one call site.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallMetrics {
    pub api_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub api_duration_ms: f64,
    pub execution_time_ms: f64,
    pub model_name: String,
    pub provider: String,
}

impl CallMetrics {
    fn new(model_name: &str, provider: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            provider: provider.to_string(),
            ..Default::default()
        }
    }

    fn add(&mut self, record: &CallRecord) {
        self.api_calls += 1;
        self.input_tokens += record.input_tokens;
        self.output_tokens += record.output_tokens;
        self.total_tokens += record.input_tokens + record.output_tokens;
        self.api_duration_ms += duration_ms(record.api_duration);
        self.execution_time_ms += duration_ms(record.execution_time);
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}

/// Identity and model of the call site a record belongs to.
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub key: CallSiteKey,
    pub function: &'a str,
    pub model_name: &'a str,
    pub provider: &'a str,
}

#[derive(Debug)]
struct Registration {
    function: String,
    sequential_id: u64,
    registration_order: u64,
    metrics: CallMetrics,
}

#[derive(Debug, Clone, Serialize)]
struct DebugLeaf {
    registration_order: u64,
    sequential_id: u64,
    #[serde(flatten)]
    metrics: CallMetrics,
}

#[derive(Debug, Default)]
struct State {
    epoch: u64,
    sites: HashMap<CallSiteKey, Registration>,
    next_sequential: HashMap<String, u64>,
    next_registration: u64,
    scopes: BTreeMap<String, BTreeMap<StateId, BTreeMap<String, DebugLeaf>>>,
}

impl State {
    fn register(&mut self, site: &CallSite<'_>) -> &mut Registration {
        let next_sequential = &mut self.next_sequential;
        let next_registration = &mut self.next_registration;
        self.sites.entry(site.key).or_insert_with(|| {
            let sequential_id = next_sequential.entry(site.function.to_string()).or_insert(0);
            *sequential_id += 1;
            *next_registration += 1;
            Registration {
                function: site.function.to_string(),
                sequential_id: *sequential_id,
                registration_order: *next_registration,
                metrics: CallMetrics::new(site.model_name, site.provider),
            }
        })
    }
}

/// Thread-safe registry of call metrics. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    state: Mutex<State>,
    next_key: AtomicU64,
    next_state: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a key for a new call site. Registration happens on its first record.
    pub fn call_site(&self) -> CallSiteKey {
        CallSiteKey(self.next_key.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Allocate an id for a new execution state.
    pub fn state_id(&self) -> StateId {
        StateId(self.next_state.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Fold one chunk call into the call site's metrics, registering the call site if needed.
    pub fn record(&self, site: CallSite<'_>, scope: &MetricsScope, record: &CallRecord) {
        let mut state = self.state.lock();

        let registration = state.register(&site);
        registration.metrics.add(record);
        let function = registration.function.clone();
        let sequential_id = registration.sequential_id;
        let registration_order = registration.registration_order;

        let leaf = state
            .scopes
            .entry(scope.thread.clone())
            .or_default()
            .entry(scope.state)
            .or_default()
            .entry(function)
            .or_insert_with(|| DebugLeaf {
                registration_order,
                sequential_id,
                metrics: CallMetrics::new(site.model_name, site.provider),
            });
        leaf.metrics.add(record);
    }

    /// Flat view: `{"llm_complete_1": {...}, ...}`.
    pub fn snapshot(&self) -> Value {
        let state = self.state.lock();
        let flat: BTreeMap<String, &CallMetrics> = state
            .sites
            .values()
            .map(|r| (format!("{}_{}", r.function, r.sequential_id), &r.metrics))
            .collect();
        json!(flat)
    }

    /// Debug view: `{"threads": {thread: {state: {function: {...}}}}, "thread_count": n}`.
    pub fn debug_snapshot(&self) -> Value {
        let state = self.state.lock();
        let threads: BTreeMap<&String, BTreeMap<String, &BTreeMap<String, DebugLeaf>>> = state
            .scopes
            .iter()
            .map(|(thread, states)| {
                let states = states.iter().map(|(id, functions)| (id.0.to_string(), functions)).collect();
                (thread, states)
            })
            .collect();
        json!({
            "threads": threads,
            "thread_count": state.scopes.len(),
        })
    }

    /// Metrics for one call site, if it has recorded anything in the current epoch.
    pub fn get(&self, key: CallSiteKey) -> Option<CallMetrics> {
        self.state.lock().sites.get(&key).map(|r| r.metrics.clone())
    }

    /// Distinct threads that recorded a call since the last reset.
    pub fn thread_count(&self) -> usize {
        self.state.lock().scopes.len()
    }

    /// Functions that have registered at least one call site, in registration order.
    pub fn registered_functions(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut sites: Vec<&Registration> = state.sites.values().collect();
        sites.sort_by_key(|r| r.registration_order);
        let mut seen = BTreeSet::new();
        sites
            .into_iter()
            .filter(|r| seen.insert(r.function.as_str()))
            .map(|r| r.function.clone())
            .collect()
    }

    /// Drop every record and restart numbering.
    pub fn reset(&self) -> &'static str {
        let mut state = self.state.lock();
        let epoch = state.epoch + 1;
        *state = State {
            epoch,
            ..Default::default()
        };
        tracing::info!(epoch, "Metrics reset");
        RESET_CONFIRMATION
    }
}
