//! Pipeline vocabulary shared by the instrumentation layer: statuses, subjects,
//! targets and the capability traits a stage component may implement.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outcome code of a single stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    Success,
    Error,
    Unschedulable,
    UnschedulableAndUnresolvable,
    Wait,
    Skip,
}

/// Status returned by every stage method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: Code,
    reasons: Vec<String>,
}

impl Status {
    pub fn success() -> Self {
        Self { code: Code::Success, reasons: Vec::new() }
    }

    pub fn new(code: Code, reason: impl Into<String>) -> Self {
        Self { code, reasons: vec![reason.into()] }
    }

    pub fn with_code(code: Code) -> Self {
        Self { code, reasons: Vec::new() }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }

    pub fn is_wait(&self) -> bool {
        self.code == Code::Wait
    }

    /// All reasons joined by ", ".
    pub fn message(&self) -> String {
        self.reasons.join(", ")
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::success()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reasons.is_empty() {
            write!(f, "{:?}", self.code)
        } else {
            write!(f, "{:?}: {}", self.code, self.message())
        }
    }
}

/// Identifies one in-flight aggregation record: `namespace + "/" + name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey(String);

impl SubjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self(format!("{}/{}", namespace, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The entity being placed, as persisted by the orchestration layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Target the subject has been bound to, if any.
    #[serde(default)]
    pub target: Option<String>,
    /// Why the last pipeline run did not bind the subject. Cleared on binding.
    #[serde(default)]
    pub condition: Option<SchedulingCondition>,
    /// Optimistic concurrency token maintained by the persistence layer.
    #[serde(default)]
    pub resource_version: u64,
}

impl Subject {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uuid::Uuid::new_v4().to_string(),
            annotations: BTreeMap::new(),
            target: None,
            condition: None,
            resource_version: 0,
        }
    }

    pub fn key(&self) -> SubjectKey {
        SubjectKey::new(&self.namespace, &self.name)
    }
}

/// A failed pipeline run as recorded on the subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingCondition {
    pub reason: String,
    pub message: String,
    /// Failed runs so far; every failure is a distinct update.
    pub attempts: u64,
}

/// A candidate destination evaluated for a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Target {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), labels: HashMap::new() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// State shared by every stage call of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct CycleContext {
    cancelled: Arc<AtomicBool>,
}

impl CycleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Targets a pre-filter plugin narrowed the evaluation down to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreFilterResult {
    pub target_names: BTreeSet<String>,
}

/// Outcome of a post-filter (e.g. preemption) plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostFilterResult {
    pub nominated_target: String,
}

/// Score of one target, as passed through normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetScore {
    pub name: String,
    pub score: i64,
}

/// Filter status of every target rejected before post-filter runs.
pub type TargetToStatus = HashMap<String, Status>;

/* ------------ capability traits -------------- */

pub trait PreEnqueuePlugin: Send + Sync {
    fn pre_enqueue(&self, subject: &Subject) -> Status;
}

pub trait QueueSortPlugin: Send + Sync {
    fn less(&self, a: &Subject, b: &Subject) -> bool;
}

pub trait PreFilterPlugin: Send + Sync {
    fn pre_filter(&self, ctx: &CycleContext, subject: &Subject) -> (Option<PreFilterResult>, Status);
}

pub trait FilterPlugin: Send + Sync {
    fn filter(&self, ctx: &CycleContext, subject: &Subject, target: &Target) -> Status;
}

pub trait PostFilterPlugin: Send + Sync {
    fn post_filter(
        &self,
        ctx: &CycleContext,
        subject: &Subject,
        filtered: &TargetToStatus,
    ) -> (Option<PostFilterResult>, Status);
}

pub trait PreScorePlugin: Send + Sync {
    fn pre_score(&self, ctx: &CycleContext, subject: &Subject, targets: &[Target]) -> Status;
}

pub trait ScorePlugin: Send + Sync {
    fn score(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> (i64, Status);

    /// Batch post-processing over every target's raw score, if supported.
    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        None
    }
}

pub trait ScoreExtensions: Send + Sync {
    fn normalize_score(&self, ctx: &CycleContext, subject: &Subject, scores: &mut [TargetScore]) -> Status;
}

pub trait ReservePlugin: Send + Sync {
    fn reserve(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> Status;
    fn unreserve(&self, ctx: &CycleContext, subject: &Subject, target: &str);
}

pub trait PermitPlugin: Send + Sync {
    fn permit(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> (Status, Duration);
}

pub trait PreBindPlugin: Send + Sync {
    fn pre_bind(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> Status;
}

pub trait BindPlugin: Send + Sync {
    fn bind(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> Status;
}

pub trait PostBindPlugin: Send + Sync {
    fn post_bind(&self, ctx: &CycleContext, subject: &Subject, target: &str);
}

/// A named stage component. Each `as_*` accessor hands out the capability handle when
/// the component implements it; implementors override only the ones they support:
///
/// ```ignore
/// fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> { Some(self) }
/// ```
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn as_pre_enqueue(self: Arc<Self>) -> Option<Arc<dyn PreEnqueuePlugin>> {
        None
    }
    fn as_queue_sort(self: Arc<Self>) -> Option<Arc<dyn QueueSortPlugin>> {
        None
    }
    fn as_pre_filter(self: Arc<Self>) -> Option<Arc<dyn PreFilterPlugin>> {
        None
    }
    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        None
    }
    fn as_post_filter(self: Arc<Self>) -> Option<Arc<dyn PostFilterPlugin>> {
        None
    }
    fn as_pre_score(self: Arc<Self>) -> Option<Arc<dyn PreScorePlugin>> {
        None
    }
    fn as_score(self: Arc<Self>) -> Option<Arc<dyn ScorePlugin>> {
        None
    }
    fn as_reserve(self: Arc<Self>) -> Option<Arc<dyn ReservePlugin>> {
        None
    }
    fn as_permit(self: Arc<Self>) -> Option<Arc<dyn PermitPlugin>> {
        None
    }
    fn as_pre_bind(self: Arc<Self>) -> Option<Arc<dyn PreBindPlugin>> {
        None
    }
    fn as_bind(self: Arc<Self>) -> Option<Arc<dyn BindPlugin>> {
        None
    }
    fn as_post_bind(self: Arc<Self>) -> Option<Arc<dyn PostBindPlugin>> {
        None
    }
}
