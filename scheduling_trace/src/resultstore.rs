//! Concurrent, subject-keyed aggregation of every stage's outcome.
//!
//! One subject is evaluated against many targets in parallel, so many callers write
//! into the same record at once. Each write is a single O(1) map mutation under one
//! coarse lock; whole-record serialization happens on a snapshot taken outside it.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, error};

use crate::annotation;
use crate::extender::SimulatorHandle;
use crate::framework::{PreFilterResult, Subject, SubjectKey};
use crate::reflector::ResultSource;

/// Recorded when a target passes a filter plugin.
pub const PASSED_FILTER_MESSAGE: &str = "passed";
/// Recorded when a plugin returns a success status.
pub const SUCCESS_MESSAGE: &str = "success";
/// Recorded when a permit plugin asks the subject to wait.
pub const WAIT_MESSAGE: &str = "wait";
/// Recorded for the target a post-filter plugin nominated.
pub const POST_FILTER_NOMINATED_MESSAGE: &str = "preemption victim";

/// Key under which the plugin result store registers with the reflector.
pub const RESULT_STORE_KEY: &str = "PluginResultStoreKey";

/// Score weight per plugin name. Absent plugins weigh zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoreWeights(HashMap<String, i64>);

impl ScoreWeights {
    pub fn new(weights: HashMap<String, i64>) -> Self {
        Self(weights)
    }

    pub fn weight(&self, plugin: &str) -> i64 {
        self.0.get(plugin).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, i64)> for ScoreWeights {
    fn from_iter<I: IntoIterator<Item = (S, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Supplies the weight table once, when the store is built.
pub trait WeightSource {
    fn score_weights(&self) -> ScoreWeights;
}

impl WeightSource for ScoreWeights {
    fn score_weights(&self) -> ScoreWeights {
        self.clone()
    }
}

type PluginResults = BTreeMap<String, String>;
type TargetResults = BTreeMap<String, PluginResults>;

/// Everything recorded for one subject during one pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
struct SchedulingResult {
    selected_target: String,
    pre_filter_status: PluginResults,
    pre_filter_result: BTreeMap<String, Vec<String>>,
    filter: TargetResults,
    post_filter: TargetResults,
    pre_score: PluginResults,
    score: TargetResults,
    final_score: TargetResults,
    permit: PluginResults,
    permit_timeout: PluginResults,
    reserve: PluginResults,
    pre_bind: PluginResults,
    bind: PluginResults,
    custom_results: BTreeMap<String, String>,
}

impl SchedulingResult {
    fn to_annotations(&self) -> serde_json::Result<HashMap<String, String>> {
        let mut out = HashMap::with_capacity(annotation::ALL_STAGE_KEYS.len() + self.custom_results.len());
        out.insert(annotation::PRE_FILTER_STATUS.to_string(), serde_json::to_string(&self.pre_filter_status)?);
        out.insert(annotation::PRE_FILTER_RESULT.to_string(), serde_json::to_string(&self.pre_filter_result)?);
        out.insert(annotation::FILTER.to_string(), serde_json::to_string(&self.filter)?);
        out.insert(annotation::POST_FILTER.to_string(), serde_json::to_string(&self.post_filter)?);
        out.insert(annotation::PRE_SCORE.to_string(), serde_json::to_string(&self.pre_score)?);
        out.insert(annotation::SCORE.to_string(), serde_json::to_string(&self.score)?);
        out.insert(annotation::FINAL_SCORE.to_string(), serde_json::to_string(&self.final_score)?);
        out.insert(annotation::PERMIT.to_string(), serde_json::to_string(&self.permit)?);
        out.insert(annotation::PERMIT_TIMEOUT.to_string(), serde_json::to_string(&self.permit_timeout)?);
        out.insert(annotation::RESERVE.to_string(), serde_json::to_string(&self.reserve)?);
        out.insert(annotation::PRE_BIND.to_string(), serde_json::to_string(&self.pre_bind)?);
        out.insert(annotation::BIND.to_string(), serde_json::to_string(&self.bind)?);
        out.insert(annotation::SELECTED_TARGET.to_string(), self.selected_target.clone());
        for (key, value) in &self.custom_results {
            out.insert(key.clone(), value.clone());
        }
        Ok(out)
    }
}

/// Shared store of scheduling results, one record per subject.
#[derive(Debug)]
pub struct ResultStore {
    results: Mutex<HashMap<SubjectKey, SchedulingResult>>,
    weights: ScoreWeights,
}

impl ResultStore {
    pub fn new(weights: ScoreWeights) -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            weights,
        }
    }

    /// Builds the store with the weight table read once from `source`.
    pub fn from_source(source: &dyn WeightSource) -> Self {
        Self::new(source.score_weights())
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Number of subjects with a record that has not been reflected yet.
    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    /// Runs `f` on the subject's record, creating it first when absent.
    fn with_record<F>(&self, namespace: &str, name: &str, f: F)
    where
        F: FnOnce(&mut SchedulingResult),
    {
        let key = SubjectKey::new(namespace, name);
        let mut results = self.results.lock();
        let record = results.entry(key).or_insert_with(|| {
            debug!(namespace, name, "Creating scheduling result record");
            SchedulingResult::default()
        });
        f(record);
    }

    pub fn add_pre_filter_result(
        &self,
        namespace: &str,
        name: &str,
        plugin: &str,
        reason: &str,
        result: Option<&PreFilterResult>,
    ) {
        self.with_record(namespace, name, |r| {
            r.pre_filter_status.insert(plugin.to_string(), reason.to_string());
            if let Some(result) = result {
                r.pre_filter_result
                    .insert(plugin.to_string(), result.target_names.iter().cloned().collect());
            }
        });
    }

    pub fn add_filter_result(&self, namespace: &str, name: &str, target: &str, plugin: &str, reason: &str) {
        self.with_record(namespace, name, |r| {
            r.filter
                .entry(target.to_string())
                .or_default()
                .insert(plugin.to_string(), reason.to_string());
        });
    }

    /// Every target in `targets` gets an entry; only the nominated one is marked.
    /// Pass an empty `nominated_target` when the plugin nominated nothing.
    pub fn add_post_filter_result(
        &self,
        namespace: &str,
        name: &str,
        nominated_target: &str,
        plugin: &str,
        targets: &[String],
    ) {
        self.with_record(namespace, name, |r| {
            for target in targets {
                let entry = r.post_filter.entry(target.clone()).or_default();
                if target == nominated_target {
                    entry.insert(plugin.to_string(), POST_FILTER_NOMINATED_MESSAGE.to_string());
                }
            }
        });
    }

    pub fn add_pre_score_result(&self, namespace: &str, name: &str, plugin: &str, reason: &str) {
        self.with_record(namespace, name, |r| {
            r.pre_score.insert(plugin.to_string(), reason.to_string());
        });
    }

    /// Records the raw score and, in the same critical section, the weighted final
    /// score. Plugins without normalization rely on this second write.
    pub fn add_score_result(&self, namespace: &str, name: &str, target: &str, plugin: &str, score: i64) {
        let weight = self.weights.weight(plugin);
        self.add_score_result_with_weight(namespace, name, target, plugin, score, weight);
    }

    /// Same as [`add_score_result`](Self::add_score_result) with an explicit weight.
    pub fn add_score_result_with_weight(
        &self,
        namespace: &str,
        name: &str,
        target: &str,
        plugin: &str,
        score: i64,
        weight: i64,
    ) {
        self.with_record(namespace, name, |r| {
            r.score
                .entry(target.to_string())
                .or_default()
                .insert(plugin.to_string(), score.to_string());
            record_final_score(r, target, plugin, score, weight);
        });
    }

    /// Overwrites the final score with the weighted normalized score.
    pub fn add_normalized_score_result(&self, namespace: &str, name: &str, target: &str, plugin: &str, score: i64) {
        let weight = self.weights.weight(plugin);
        self.add_normalized_score_result_with_weight(namespace, name, target, plugin, score, weight);
    }

    pub fn add_normalized_score_result_with_weight(
        &self,
        namespace: &str,
        name: &str,
        target: &str,
        plugin: &str,
        score: i64,
        weight: i64,
    ) {
        self.with_record(namespace, name, |r| {
            record_final_score(r, target, plugin, score, weight);
        });
    }

    pub fn add_permit_result(&self, namespace: &str, name: &str, plugin: &str, status: &str, timeout: Duration) {
        self.with_record(namespace, name, |r| {
            r.permit.insert(plugin.to_string(), status.to_string());
            r.permit_timeout.insert(plugin.to_string(), format_duration(timeout));
        });
    }

    pub fn add_reserve_result(&self, namespace: &str, name: &str, plugin: &str, status: &str) {
        self.with_record(namespace, name, |r| {
            r.reserve.insert(plugin.to_string(), status.to_string());
        });
    }

    pub fn add_pre_bind_result(&self, namespace: &str, name: &str, plugin: &str, status: &str) {
        self.with_record(namespace, name, |r| {
            r.pre_bind.insert(plugin.to_string(), status.to_string());
        });
    }

    pub fn add_bind_result(&self, namespace: &str, name: &str, plugin: &str, status: &str) {
        self.with_record(namespace, name, |r| {
            r.bind.insert(plugin.to_string(), status.to_string());
        });
    }

    pub fn add_selected_target(&self, namespace: &str, name: &str, target: &str) {
        self.with_record(namespace, name, |r| {
            r.selected_target = target.to_string();
        });
    }

    /// Attaches arbitrary data published under `annotation_key`.
    pub fn add_custom_result(&self, namespace: &str, name: &str, annotation_key: &str, value: &str) {
        self.with_record(namespace, name, |r| {
            r.custom_results.insert(annotation_key.to_string(), value.to_string());
        });
    }

    /// Serializes the subject's record into annotation key → value pairs.
    ///
    /// Returns `None` when nothing was recorded for the subject, or when any category
    /// fails to serialize: a partial set is never returned.
    pub fn get_stored_result(&self, namespace: &str, name: &str) -> Option<HashMap<String, String>> {
        let key = SubjectKey::new(namespace, name);
        let snapshot = self.results.lock().get(&key).cloned()?;

        match snapshot.to_annotations() {
            Ok(annotations) => Some(annotations),
            Err(e) => {
                error!(subject = %key, "Failed to encode scheduling results: {}", e);
                None
            }
        }
    }

    /// Drops the subject's record. Call only once its results are durably applied.
    pub fn delete_data(&self, namespace: &str, name: &str) {
        let key = SubjectKey::new(namespace, name);
        if self.results.lock().remove(&key).is_some() {
            debug!(subject = %key, "Deleted scheduling result record");
        }
    }
}

fn record_final_score(r: &mut SchedulingResult, target: &str, plugin: &str, score: i64, weight: i64) {
    r.final_score
        .entry(target.to_string())
        .or_default()
        .insert(plugin.to_string(), score.saturating_mul(weight).to_string());
}

impl SimulatorHandle for ResultStore {
    fn add_custom_result(&self, namespace: &str, name: &str, annotation_key: &str, value: &str) {
        ResultStore::add_custom_result(self, namespace, name, annotation_key, value);
    }
}

impl ResultSource for ResultStore {
    fn get_stored_result(&self, subject: &Subject) -> Option<HashMap<String, String>> {
        ResultStore::get_stored_result(self, &subject.namespace, &subject.name)
    }

    fn delete_data(&self, subject: &Subject) {
        ResultStore::delete_data(self, &subject.namespace, &subject.name);
    }
}

/// Renders a duration the way the scheduler prints permit timeouts: `0s`, `500ms`,
/// `1.5s`, `1m30s`, `2h0m0s`.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_secs(1) {
        let nanos = d.as_nanos();
        return if nanos < 1_000 {
            format!("{}ns", nanos)
        } else if nanos < 1_000_000 {
            format!("{}µs", nanos as f64 / 1e3)
        } else {
            format!("{}ms", nanos as f64 / 1e6)
        };
    }

    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = (total % 60) as f64 + f64::from(d.subsec_nanos()) / 1e9;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", seconds));
    out
}
