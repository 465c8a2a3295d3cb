//! Sample plugins and a small pipeline driver used by the `demo` command.
//!
//! Subjects carry a resource request in [`REQUEST_ANNOTATION`]; targets advertise a
//! `capacity` label and a `zone` label. The driver runs every stage the way a
//! scheduler would, evaluating targets concurrently, and binds the subject by
//! persisting its chosen target. That update is what the reflector reacts to.

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{retry_with_backoff, BackoffConfig};
use crate::framework::{
    BindPlugin, Code, CycleContext, FilterPlugin, PermitPlugin, Plugin, PostBindPlugin, PostFilterPlugin,
    PostFilterResult, PreBindPlugin, PreFilterPlugin, PreFilterResult, PreScorePlugin, QueueSortPlugin,
    ReservePlugin, SchedulingCondition, ScoreExtensions, ScorePlugin, Status, Subject, SubjectKey, Target,
    TargetScore, TargetToStatus,
};
use crate::inmemory::InMemorySubjectStore;
use crate::reflector::{CompletionFilter, PersistenceClient, Reflector, RunSummary};
use crate::registry::{wrap_registry, PluginArgs, PluginFactory, Registry};
use crate::resultstore::{ResultStore, ScoreWeights, WeightSource, RESULT_STORE_KEY};
use crate::settings::Settings;
use crate::wrapped::WRAPPED_SUFFIX;

pub const REQUEST_ANNOTATION: &str = "demo.schedtrace.io/request";
pub const PRIORITY_ANNOTATION: &str = "demo.schedtrace.io/priority";
pub const ZONE_ANNOTATION: &str = "demo.schedtrace.io/zone";
pub const CAPACITY_LABEL: &str = "capacity";
pub const ZONE_LABEL: &str = "zone";

fn annotation_i64(subject: &Subject, key: &str) -> i64 {
    subject
        .annotations
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

fn capacity(target: &Target) -> i64 {
    target
        .labels
        .get(CAPACITY_LABEL)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

/* ------------ sample plugins -------------- */

/// Rejects targets without room for the request and prefers the roomiest ones.
///
/// Free capacity of the feasible targets is captured at pre-score, per subject, and
/// released once the subject's scores are normalized.
pub struct CapacityFit {
    capacities: Mutex<HashMap<SubjectKey, HashMap<String, i64>>>,
}

impl CapacityFit {
    pub const NAME: &'static str = "CapacityFit";

    pub fn new() -> Self {
        Self { capacities: Mutex::new(HashMap::new()) }
    }

    /// Subjects whose captured capacities have not been released yet.
    pub fn tracked_subjects(&self) -> usize {
        self.capacities.lock().len()
    }
}

impl Default for CapacityFit {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterPlugin for CapacityFit {
    fn filter(&self, _ctx: &CycleContext, subject: &Subject, target: &Target) -> Status {
        if capacity(target) < annotation_i64(subject, REQUEST_ANNOTATION) {
            return Status::new(Code::Unschedulable, "insufficient capacity");
        }
        Status::success()
    }
}

impl PreScorePlugin for CapacityFit {
    fn pre_score(&self, _ctx: &CycleContext, subject: &Subject, targets: &[Target]) -> Status {
        let free = targets.iter().map(|t| (t.name.clone(), capacity(t))).collect();
        // a later run for the same subject replaces what an aborted one left behind
        self.capacities.lock().insert(subject.key(), free);
        Status::success()
    }
}

impl ScorePlugin for CapacityFit {
    fn score(&self, _ctx: &CycleContext, subject: &Subject, target: &str) -> (i64, Status) {
        let free = self
            .capacities
            .lock()
            .get(&subject.key())
            .and_then(|targets| targets.get(target).copied());
        match free {
            Some(free) => (free - annotation_i64(subject, REQUEST_ANNOTATION), Status::success()),
            None => (0, Status::new(Code::Error, format!("target {} was not pre-scored", target))),
        }
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        Some(self)
    }
}

impl ScoreExtensions for CapacityFit {
    /// Scales scores into 0..=100.
    fn normalize_score(&self, _ctx: &CycleContext, subject: &Subject, scores: &mut [TargetScore]) -> Status {
        self.capacities.lock().remove(&subject.key());
        let max = scores.iter().map(|s| s.score).max().unwrap_or_default();
        if max <= 0 {
            return Status::success();
        }
        for s in scores.iter_mut() {
            s.score = s.score.max(0) * 100 / max;
        }
        Status::success()
    }
}

impl Plugin for CapacityFit {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        Some(self)
    }
    fn as_pre_score(self: Arc<Self>) -> Option<Arc<dyn PreScorePlugin>> {
        Some(self)
    }
    fn as_score(self: Arc<Self>) -> Option<Arc<dyn ScorePlugin>> {
        Some(self)
    }
}

/// Prefers targets in the subject's requested zone.
pub struct ZoneAffinity;

impl ZoneAffinity {
    pub const NAME: &'static str = "ZoneAffinity";
}

impl PreFilterPlugin for ZoneAffinity {
    fn pre_filter(&self, _ctx: &CycleContext, subject: &Subject) -> (Option<PreFilterResult>, Status) {
        if subject.annotations.contains_key(ZONE_ANNOTATION) {
            (None, Status::success())
        } else {
            (None, Status::new(Code::Skip, "no zone requested"))
        }
    }
}

impl PreScorePlugin for ZoneAffinity {
    fn pre_score(&self, _ctx: &CycleContext, _subject: &Subject, targets: &[Target]) -> Status {
        if targets.iter().any(|t| t.labels.contains_key(ZONE_LABEL)) {
            Status::success()
        } else {
            Status::new(Code::Skip, "no zoned targets")
        }
    }
}

impl ScorePlugin for ZoneAffinity {
    fn score(&self, _ctx: &CycleContext, subject: &Subject, target: &str) -> (i64, Status) {
        let wanted = subject.annotations.get(ZONE_ANNOTATION).map(String::as_str);
        // target names are "<zone>-<n>"
        let zone = target.split('-').next();
        let score = if wanted.is_some() && wanted == zone { 100 } else { 0 };
        (score, Status::success())
    }
}

impl Plugin for ZoneAffinity {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn as_pre_filter(self: Arc<Self>) -> Option<Arc<dyn PreFilterPlugin>> {
        Some(self)
    }
    fn as_pre_score(self: Arc<Self>) -> Option<Arc<dyn PreScorePlugin>> {
        Some(self)
    }
    fn as_score(self: Arc<Self>) -> Option<Arc<dyn ScorePlugin>> {
        Some(self)
    }
}

/// Orders subjects by descending priority.
pub struct PrioritySort;

impl PrioritySort {
    pub const NAME: &'static str = "PrioritySort";
}

impl QueueSortPlugin for PrioritySort {
    fn less(&self, a: &Subject, b: &Subject) -> bool {
        annotation_i64(a, PRIORITY_ANNOTATION) > annotation_i64(b, PRIORITY_ANNOTATION)
    }
}

impl Plugin for PrioritySort {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn as_queue_sort(self: Arc<Self>) -> Option<Arc<dyn QueueSortPlugin>> {
        Some(self)
    }
}

/// Keeps a ledger of reserved capacity per target.
#[derive(Default)]
pub struct CapacityLedger {
    reserved: Mutex<HashMap<String, i64>>,
}

impl CapacityLedger {
    pub const NAME: &'static str = "CapacityLedger";

    pub fn reserved(&self, target: &str) -> i64 {
        self.reserved.lock().get(target).copied().unwrap_or_default()
    }
}

impl ReservePlugin for CapacityLedger {
    fn reserve(&self, _ctx: &CycleContext, subject: &Subject, target: &str) -> Status {
        *self.reserved.lock().entry(target.to_string()).or_default() += annotation_i64(subject, REQUEST_ANNOTATION);
        Status::success()
    }

    fn unreserve(&self, _ctx: &CycleContext, subject: &Subject, target: &str) {
        if let Some(used) = self.reserved.lock().get_mut(target) {
            *used -= annotation_i64(subject, REQUEST_ANNOTATION);
        }
    }
}

impl PreBindPlugin for CapacityLedger {
    fn pre_bind(&self, _ctx: &CycleContext, _subject: &Subject, target: &str) -> Status {
        if self.reserved(target) < 0 {
            return Status::new(Code::Error, format!("ledger for {} went negative", target));
        }
        Status::success()
    }
}

impl Plugin for CapacityLedger {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn as_reserve(self: Arc<Self>) -> Option<Arc<dyn ReservePlugin>> {
        Some(self)
    }
    fn as_pre_bind(self: Arc<Self>) -> Option<Arc<dyn PreBindPlugin>> {
        Some(self)
    }
}

/// Admits every subject, asking high-priority ones to wait briefly.
pub struct AdmissionGate;

impl AdmissionGate {
    pub const NAME: &'static str = "AdmissionGate";
}

impl PermitPlugin for AdmissionGate {
    fn permit(&self, _ctx: &CycleContext, subject: &Subject, _target: &str) -> (Status, Duration) {
        if annotation_i64(subject, PRIORITY_ANNOTATION) > 100 {
            return (Status::with_code(Code::Wait), Duration::from_secs(10));
        }
        (Status::success(), Duration::ZERO)
    }
}

impl Plugin for AdmissionGate {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn as_permit(self: Arc<Self>) -> Option<Arc<dyn PermitPlugin>> {
        Some(self)
    }
}

/// Nominates the rejected target that sorts first by name.
pub struct Preemption;

impl Preemption {
    pub const NAME: &'static str = "Preemption";
}

impl PostFilterPlugin for Preemption {
    fn post_filter(
        &self,
        _ctx: &CycleContext,
        _subject: &Subject,
        filtered: &TargetToStatus,
    ) -> (Option<PostFilterResult>, Status) {
        let mut names: Vec<&String> = filtered.keys().collect();
        names.sort();
        match names.first() {
            Some(name) => (
                Some(PostFilterResult { nominated_target: (*name).clone() }),
                Status::success(),
            ),
            None => (None, Status::new(Code::Unschedulable, "no preemption candidates")),
        }
    }
}

impl Plugin for Preemption {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn as_post_filter(self: Arc<Self>) -> Option<Arc<dyn PostFilterPlugin>> {
        Some(self)
    }
}

/// Accepts the binding; the driver persists it.
pub struct DirectBinder;

impl DirectBinder {
    pub const NAME: &'static str = "DirectBinder";
}

impl BindPlugin for DirectBinder {
    fn bind(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) -> Status {
        Status::success()
    }
}

impl PostBindPlugin for DirectBinder {
    fn post_bind(&self, _ctx: &CycleContext, subject: &Subject, target: &str) {
        debug!(subject = %subject.key(), target, "Bound");
    }
}

impl Plugin for DirectBinder {
    fn name(&self) -> &str {
        Self::NAME
    }
    fn as_bind(self: Arc<Self>) -> Option<Arc<dyn BindPlugin>> {
        Some(self)
    }
    fn as_post_bind(self: Arc<Self>) -> Option<Arc<dyn PostBindPlugin>> {
        Some(self)
    }
}

fn factory<P, F>(make: F) -> PluginFactory
where
    P: Plugin + 'static,
    F: Fn() -> P + Send + Sync + 'static,
{
    Arc::new(move |_args: &PluginArgs| {
        let plugin: Arc<dyn Plugin> = Arc::new(make());
        Ok(plugin)
    })
}

/// Registry holding every sample plugin under its own name.
pub fn registry() -> Result<Registry> {
    let mut registry = Registry::new();
    registry.register(CapacityFit::NAME, factory(CapacityFit::new))?;
    registry.register(ZoneAffinity::NAME, factory(|| ZoneAffinity))?;
    registry.register(PrioritySort::NAME, factory(|| PrioritySort))?;
    registry.register(CapacityLedger::NAME, factory(CapacityLedger::default))?;
    registry.register(AdmissionGate::NAME, factory(|| AdmissionGate))?;
    registry.register(Preemption::NAME, factory(|| Preemption))?;
    registry.register(DirectBinder::NAME, factory(|| DirectBinder))?;
    Ok(registry)
}

/// Accepts the updates that end a pipeline run: binding the subject to a target, or
/// recording a new failed run on it. Annotation-only updates are turned down.
pub fn completion_filter() -> CompletionFilter {
    Arc::new(|old: &Subject, new: &Subject| {
        let bound = old.target.is_none() && new.target.is_some();
        let failed = new.condition.is_some() && new.condition != old.condition;
        bound || failed
    })
}

/* ------------ pipeline driver -------------- */

/// How one pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Scheduled(String),
    /// No target fits; a post-filter plugin may have nominated one.
    Unschedulable { nominated: Option<String> },
    Rejected(Status),
}

impl ScheduleOutcome {
    /// Reason and message to record on the subject, `None` when it was scheduled.
    pub fn failure(&self) -> Option<(String, String)> {
        match self {
            ScheduleOutcome::Scheduled(_) => None,
            ScheduleOutcome::Unschedulable { nominated: Some(target) } => Some((
                "Unschedulable".to_string(),
                format!("no target fits, nominated {}", target),
            )),
            ScheduleOutcome::Unschedulable { nominated: None } => {
                Some(("Unschedulable".to_string(), "no target fits".to_string()))
            }
            ScheduleOutcome::Rejected(status) => Some((format!("{:?}", status.code()), status.message())),
        }
    }
}

/// Runs subjects through a set of plugins stage by stage.
pub struct Pipeline {
    queue_sort: Option<Arc<dyn QueueSortPlugin>>,
    pre_filter: Vec<Arc<dyn PreFilterPlugin>>,
    filter: Arc<Vec<Arc<dyn FilterPlugin>>>,
    post_filter: Vec<Arc<dyn PostFilterPlugin>>,
    pre_score: Vec<Arc<dyn PreScorePlugin>>,
    score: Vec<(String, Arc<dyn ScorePlugin>)>,
    reserve: Vec<Arc<dyn ReservePlugin>>,
    permit: Vec<Arc<dyn PermitPlugin>>,
    pre_bind: Vec<Arc<dyn PreBindPlugin>>,
    bind: Vec<Arc<dyn BindPlugin>>,
    post_bind: Vec<Arc<dyn PostBindPlugin>>,
    weights: ScoreWeights,
}

impl Pipeline {
    pub fn new(plugins: &[Arc<dyn Plugin>], weights: ScoreWeights) -> Self {
        let mut filter = Vec::new();
        let mut pipeline = Self {
            queue_sort: None,
            pre_filter: Vec::new(),
            filter: Arc::new(Vec::new()),
            post_filter: Vec::new(),
            pre_score: Vec::new(),
            score: Vec::new(),
            reserve: Vec::new(),
            permit: Vec::new(),
            pre_bind: Vec::new(),
            bind: Vec::new(),
            post_bind: Vec::new(),
            weights,
        };

        for plugin in plugins {
            let name = plugin.name().to_string();
            if let Some(p) = plugin.clone().as_queue_sort() {
                if pipeline.queue_sort.is_some() {
                    warn!("Ignoring second queue-sort plugin {}", name);
                } else {
                    pipeline.queue_sort = Some(p);
                }
            }
            pipeline.pre_filter.extend(plugin.clone().as_pre_filter());
            filter.extend(plugin.clone().as_filter());
            pipeline.post_filter.extend(plugin.clone().as_post_filter());
            pipeline.pre_score.extend(plugin.clone().as_pre_score());
            if let Some(p) = plugin.clone().as_score() {
                pipeline.score.push((name, p));
            }
            pipeline.reserve.extend(plugin.clone().as_reserve());
            pipeline.permit.extend(plugin.clone().as_permit());
            pipeline.pre_bind.extend(plugin.clone().as_pre_bind());
            pipeline.bind.extend(plugin.clone().as_bind());
            pipeline.post_bind.extend(plugin.clone().as_post_bind());
        }
        pipeline.filter = Arc::new(filter);
        pipeline
    }

    /// Orders subjects with the queue-sort plugin, if any.
    pub fn sort(&self, subjects: &mut [Subject]) {
        if let Some(sorter) = &self.queue_sort {
            subjects.sort_by(|a, b| {
                if sorter.less(a, b) {
                    std::cmp::Ordering::Less
                } else if sorter.less(b, a) {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            });
        }
    }

    fn weight(&self, plugin: &str) -> i64 {
        self.weights.weight(plugin.strip_suffix(WRAPPED_SUFFIX).unwrap_or(plugin))
    }

    /// One pipeline run for `subject`. Binding is left to the caller.
    #[instrument(skip_all, fields(subject = %subject.key()))]
    pub async fn schedule(&self, ctx: &CycleContext, subject: &Subject, targets: &[Target]) -> ScheduleOutcome {
        let mut allowed: Option<BTreeSet<String>> = None;
        for p in &self.pre_filter {
            let (result, status) = p.pre_filter(ctx, subject);
            if status.code() == Code::Skip {
                continue;
            }
            if !status.is_success() {
                return ScheduleOutcome::Rejected(status);
            }
            if let Some(result) = result {
                allowed = Some(match allowed {
                    Some(prev) => prev.intersection(&result.target_names).cloned().collect(),
                    None => result.target_names,
                });
            }
        }

        let candidates: Vec<Target> = targets
            .iter()
            .filter(|t| allowed.as_ref().map_or(true, |a| a.contains(&t.name)))
            .cloned()
            .collect();
        let (feasible, rejected) = self.filter_targets(ctx, subject, candidates).await;

        if feasible.is_empty() {
            for p in &self.post_filter {
                let (result, status) = p.post_filter(ctx, subject, &rejected);
                if status.is_success() {
                    return ScheduleOutcome::Unschedulable { nominated: result.map(|r| r.nominated_target) };
                }
            }
            return ScheduleOutcome::Unschedulable { nominated: None };
        }

        for p in &self.pre_score {
            let status = p.pre_score(ctx, subject, &feasible);
            if !status.is_success() && status.code() != Code::Skip {
                return ScheduleOutcome::Rejected(status);
            }
        }

        let totals = match self.score_targets(ctx, subject, &feasible).await {
            Ok(totals) => totals,
            Err(status) => return ScheduleOutcome::Rejected(status),
        };
        // highest total wins, ties go to the first name
        let Some(selected) = totals
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(name, _)| name.clone())
        else {
            return ScheduleOutcome::Unschedulable { nominated: None };
        };

        for p in &self.reserve {
            let status = p.reserve(ctx, subject, &selected);
            if !status.is_success() {
                self.unreserve(ctx, subject, &selected);
                return ScheduleOutcome::Rejected(status);
            }
        }

        for p in &self.permit {
            let (status, timeout) = p.permit(ctx, subject, &selected);
            if status.is_wait() {
                // nothing here ever rejects a waiting subject
                debug!("Permit asked to wait up to {:?}, admitting", timeout);
            } else if !status.is_success() {
                self.unreserve(ctx, subject, &selected);
                return ScheduleOutcome::Rejected(status);
            }
        }

        for p in &self.pre_bind {
            let status = p.pre_bind(ctx, subject, &selected);
            if !status.is_success() {
                self.unreserve(ctx, subject, &selected);
                return ScheduleOutcome::Rejected(status);
            }
        }

        let mut bound = false;
        for p in &self.bind {
            let status = p.bind(ctx, subject, &selected);
            if status.code() == Code::Skip {
                continue;
            }
            if !status.is_success() {
                self.unreserve(ctx, subject, &selected);
                return ScheduleOutcome::Rejected(status);
            }
            bound = true;
            break;
        }
        if !bound {
            self.unreserve(ctx, subject, &selected);
            return ScheduleOutcome::Rejected(Status::new(Code::Error, "no bind plugin bound the subject"));
        }

        for p in &self.post_bind {
            p.post_bind(ctx, subject, &selected);
        }
        ScheduleOutcome::Scheduled(selected)
    }

    fn unreserve(&self, ctx: &CycleContext, subject: &Subject, target: &str) {
        for p in self.reserve.iter().rev() {
            p.unreserve(ctx, subject, target);
        }
    }

    /// Runs every filter plugin against every candidate, one task per target.
    async fn filter_targets(
        &self,
        ctx: &CycleContext,
        subject: &Subject,
        candidates: Vec<Target>,
    ) -> (Vec<Target>, TargetToStatus) {
        let mut tasks = JoinSet::new();
        for target in candidates {
            let filters = self.filter.clone();
            let ctx = ctx.clone();
            let subject = subject.clone();
            tasks.spawn(async move {
                for f in filters.iter() {
                    let status = f.filter(&ctx, &subject, &target);
                    if !status.is_success() {
                        return (target, Some(status));
                    }
                }
                (target, None)
            });
        }

        let mut feasible = Vec::new();
        let mut rejected = TargetToStatus::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((target, None)) => feasible.push(target),
                Ok((target, Some(status))) => {
                    rejected.insert(target.name, status);
                }
                Err(e) => warn!("Filter task failed: {}", e),
            }
        }
        feasible.sort_by(|a, b| a.name.cmp(&b.name));
        (feasible, rejected)
    }

    /// Weighted score totals per target. Each plugin scores all targets concurrently.
    async fn score_targets(
        &self,
        ctx: &CycleContext,
        subject: &Subject,
        feasible: &[Target],
    ) -> std::result::Result<BTreeMap<String, i64>, Status> {
        let mut totals: BTreeMap<String, i64> = feasible.iter().map(|t| (t.name.clone(), 0)).collect();

        for (name, plugin) in &self.score {
            let mut tasks = JoinSet::new();
            for target in feasible {
                let plugin = plugin.clone();
                let ctx = ctx.clone();
                let subject = subject.clone();
                let target = target.name.clone();
                tasks.spawn(async move {
                    let (score, status) = plugin.score(&ctx, &subject, &target);
                    (TargetScore { name: target, score }, status)
                });
            }

            let mut scores = Vec::with_capacity(feasible.len());
            while let Some(joined) = tasks.join_next().await {
                let (score, status) = joined.map_err(|e| Status::new(Code::Error, e.to_string()))?;
                if !status.is_success() {
                    return Err(status);
                }
                scores.push(score);
            }
            scores.sort_by(|a, b| a.name.cmp(&b.name));

            if let Some(ext) = plugin.score_extensions() {
                let status = ext.normalize_score(ctx, subject, &mut scores);
                if !status.is_success() {
                    return Err(status);
                }
            }

            let weight = self.weight(name);
            for s in scores {
                *totals.entry(s.name).or_default() += s.score * weight;
            }
        }
        Ok(totals)
    }
}

/// Applies `change` to the latest version of the subject and persists it,
/// re-reading the subject on conflicts.
async fn update_with_retry<F>(
    client: &dyn PersistenceClient,
    backoff: &BackoffConfig,
    subject: &Subject,
    change: F,
) -> Result<()>
where
    F: Fn(&mut Subject) + Sync,
{
    let change = &change;
    retry_with_backoff(backoff, || async move {
        let mut latest = client
            .get(&subject.namespace, &subject.name)
            .await
            .with_context(|| format!("get subject {}", subject.key()))?;
        change(&mut latest);
        match client.update(latest).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(anyhow!(e)),
        }
    })
    .await
}

/// Persists `target` as the subject's binding.
pub async fn bind_subject(
    client: &dyn PersistenceClient,
    backoff: &BackoffConfig,
    subject: &Subject,
    target: &str,
) -> Result<()> {
    update_with_retry(client, backoff, subject, |latest| {
        latest.target = Some(target.to_string());
        latest.condition = None;
    })
    .await
}

/// Records a failed run on the subject so its results get published too.
pub async fn record_failure(
    client: &dyn PersistenceClient,
    backoff: &BackoffConfig,
    subject: &Subject,
    reason: &str,
    message: &str,
) -> Result<()> {
    update_with_retry(client, backoff, subject, |latest| {
        let attempts = latest.condition.as_ref().map_or(0, |c| c.attempts) + 1;
        latest.condition = Some(SchedulingCondition {
            reason: reason.to_string(),
            message: message.to_string(),
            attempts,
        });
    })
    .await
}

/// Creates `count` targets spread over three zones with varying capacity.
pub fn sample_targets(count: usize) -> Vec<Target> {
    const ZONES: [&str; 3] = ["east", "west", "north"];
    (0..count)
        .map(|i| {
            let zone = ZONES[i % ZONES.len()];
            Target::new(format!("{}-{}", zone, i))
                .with_label(ZONE_LABEL, zone)
                .with_label(CAPACITY_LABEL, ((i % 5 + 1) * 10).to_string())
        })
        .collect()
}

/// Creates `count` subjects in `namespace` with varying requests and priorities.
pub fn sample_subjects(namespace: &str, count: usize) -> Vec<Subject> {
    (0..count)
        .map(|i| {
            let mut subject = Subject::new(namespace, format!("subject-{}", i));
            subject
                .annotations
                .insert(REQUEST_ANNOTATION.to_string(), ((i % 6) * 10).to_string());
            subject
                .annotations
                .insert(PRIORITY_ANNOTATION.to_string(), ((i * 37) % 150).to_string());
            if i % 2 == 0 {
                subject.annotations.insert(ZONE_ANNOTATION.to_string(), "west".to_string());
            }
            subject
        })
        .collect()
}

/// Schedules every subject, binding the scheduled ones in `subjects_store` and
/// recording the failure on the others. Returns the outcome per subject key.
pub async fn schedule_all(
    pipeline: &Pipeline,
    subjects_store: &InMemorySubjectStore,
    backoff: &BackoffConfig,
    mut subjects: Vec<Subject>,
    targets: &[Target],
) -> Result<Vec<(String, ScheduleOutcome)>> {
    pipeline.sort(&mut subjects);
    let mut outcomes = Vec::with_capacity(subjects.len());

    for subject in subjects {
        let subject = subjects_store.create(subject)?;
        let ctx = CycleContext::new();
        let outcome = pipeline.schedule(&ctx, &subject, targets).await;
        match &outcome {
            ScheduleOutcome::Scheduled(target) => {
                bind_subject(subjects_store, backoff, &subject, target).await?;
                info!("Scheduled {} on {}", subject.key(), target);
            }
            other => {
                let (reason, message) = other.failure().unwrap_or_default();
                record_failure(subjects_store, backoff, &subject, &reason, &message).await?;
                info!("Did not schedule {}: {:?}", subject.key(), other);
            }
        }
        outcomes.push((subject.key().to_string(), outcome));
    }
    Ok(outcomes)
}

/// What the demo command prints.
#[derive(Debug, Serialize)]
pub struct DemoReport {
    pub outcomes: BTreeMap<String, ScheduleOutcome>,
    pub reflector: RunSummary,
    /// Annotations of every subject after reflection.
    pub annotations: BTreeMap<String, BTreeMap<String, String>>,
    /// Records still held by the result store.
    pub unreflected: usize,
}

/// Wires the sample plugins, the result store and the reflector together, schedules
/// `subjects` sample subjects onto `targets` sample targets and reports what ended
/// up on each subject.
pub async fn run(settings: &Settings, namespace: &str, subjects: usize, targets: usize) -> Result<DemoReport> {
    let profile = &settings.profile;
    let store = Arc::new(ResultStore::new(profile.score_weights()));

    let wrapped = wrap_registry(store.clone(), &registry()?, &profile.enabled_plugins(), &HashMap::new())?;
    let plugins = wrapped
        .names()
        .map(|name| wrapped.instantiate(name, &PluginArgs::Null))
        .collect::<Result<Vec<_>>>()?;
    debug!("Instantiated {:?}", plugins.iter().map(|p| p.name()).collect::<Vec<_>>());
    let pipeline = Pipeline::new(&plugins, profile.score_weights());

    let backoff = settings.reflector.backoff.to_config();
    let subject_store = Arc::new(InMemorySubjectStore::new());
    let reflector = Arc::new(
        Reflector::new(subject_store.clone())
            .with_backoff(backoff)
            .with_max_concurrent_reflections(settings.reflector.max_concurrent_reflections)
            .with_completion_filter(completion_filter()),
    );
    reflector.add_result_source(RESULT_STORE_KEY, store.clone());

    let feed = subject_store.subscribe();
    let reflecting = tokio::spawn(reflector.run(feed));

    let scheduled = schedule_all(
        &pipeline,
        &subject_store,
        &backoff,
        sample_subjects(namespace, subjects),
        &sample_targets(targets),
    )
    .await;
    subject_store.close_feed();
    let summary = reflecting.await.context("reflector task failed")?;
    let outcomes = scheduled?;

    let annotations = outcomes
        .iter()
        .filter_map(|(key, _)| {
            let (ns, name) = key.split_once('/')?;
            subject_store
                .get_subject(ns, name)
                .map(|s| (key.clone(), s.annotations))
        })
        .collect();

    info!(
        "Demo finished: {} reflected, {} failed, {} records left",
        summary.reflected,
        summary.failed,
        store.len()
    );
    Ok(DemoReport {
        outcomes: outcomes.into_iter().collect(),
        reflector: summary,
        annotations,
        unreflected: store.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(plugins: Vec<Arc<dyn Plugin>>) -> Pipeline {
        let weights: ScoreWeights = [(CapacityFit::NAME, 1), (ZoneAffinity::NAME, 1)].into_iter().collect();
        Pipeline::new(&plugins, weights)
    }

    #[tokio::test]
    async fn test_roomiest_target_wins() {
        let pipeline = plain(vec![Arc::new(CapacityFit::new()), Arc::new(DirectBinder)]);
        let mut subject = Subject::new("ns", "p");
        subject.annotations.insert(REQUEST_ANNOTATION.into(), "15".into());
        let targets = vec![
            Target::new("east-0").with_label(CAPACITY_LABEL, "10"),
            Target::new("east-1").with_label(CAPACITY_LABEL, "40"),
            Target::new("east-2").with_label(CAPACITY_LABEL, "20"),
        ];

        let outcome = pipeline.schedule(&CycleContext::new(), &subject, &targets).await;
        assert_eq!(outcome, ScheduleOutcome::Scheduled("east-1".to_string()));
    }

    #[tokio::test]
    async fn test_preemption_nominates_when_nothing_fits() {
        let pipeline = plain(vec![Arc::new(CapacityFit::new()), Arc::new(Preemption)]);
        let mut subject = Subject::new("ns", "p");
        subject.annotations.insert(REQUEST_ANNOTATION.into(), "99".into());

        let outcome = pipeline.schedule(&CycleContext::new(), &subject, &sample_targets(3)).await;
        assert_eq!(outcome, ScheduleOutcome::Unschedulable { nominated: Some("east-0".to_string()) });
    }

    #[test]
    fn test_capacity_fit_keeps_subjects_apart() {
        let fit = CapacityFit::new();
        let ctx = CycleContext::new();
        let mut small = Subject::new("ns", "small");
        small.annotations.insert(REQUEST_ANNOTATION.into(), "5".into());
        let mut large = Subject::new("ns", "large");
        large.annotations.insert(REQUEST_ANNOTATION.into(), "25".into());

        // same target name, relabelled between the two runs
        fit.pre_score(&ctx, &small, &[Target::new("east-0").with_label(CAPACITY_LABEL, "10")]);
        fit.pre_score(&ctx, &large, &[Target::new("east-0").with_label(CAPACITY_LABEL, "40")]);
        assert_eq!(fit.tracked_subjects(), 2);

        assert_eq!(fit.score(&ctx, &small, "east-0").0, 5);
        assert_eq!(fit.score(&ctx, &large, "east-0").0, 15);

        let mut scores = vec![TargetScore { name: "east-0".into(), score: 5 }];
        assert!(fit.normalize_score(&ctx, &small, &mut scores).is_success());
        assert_eq!(fit.tracked_subjects(), 1);
        assert!(!fit.score(&ctx, &small, "east-0").1.is_success());
    }

    #[tokio::test]
    async fn test_capacity_fit_releases_state_after_run() {
        let fit = Arc::new(CapacityFit::new());
        let plugin: Arc<dyn Plugin> = fit.clone();
        let pipeline = plain(vec![plugin, Arc::new(DirectBinder)]);
        for subject in sample_subjects("ns", 4) {
            let outcome = pipeline.schedule(&CycleContext::new(), &subject, &sample_targets(6)).await;
            assert!(matches!(outcome, ScheduleOutcome::Scheduled(_)));
        }
        assert_eq!(fit.tracked_subjects(), 0);
    }

    #[test]
    fn test_priority_sort() {
        let pipeline = plain(vec![Arc::new(PrioritySort)]);
        let mut subjects = sample_subjects("ns", 4);
        pipeline.sort(&mut subjects);
        let priorities: Vec<i64> = subjects.iter().map(|s| annotation_i64(s, PRIORITY_ANNOTATION)).collect();
        assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_registry_has_every_sample_plugin() {
        let registry = registry().unwrap();
        assert_eq!(registry.len(), 7);
        assert!(registry.contains(CapacityFit::NAME));
        assert!(registry.contains(DirectBinder::NAME));
    }
}
