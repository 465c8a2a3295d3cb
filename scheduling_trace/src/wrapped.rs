//! A plugin wrapper that records every stage outcome of the plugin it wraps into the
//! [`ResultStore`] and runs the configured extender hooks around each stage.
//!
//! The wrapper exposes every capability to the pipeline. For a capability the
//! original plugin lacks it returns the neutral value that leaves the pipeline's
//! decision unchanged, and it records nothing.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::extender::{ExtenderInitializer, PluginExtenders, SimulatorHandle};
use crate::framework::{
    BindPlugin, Code, CycleContext, FilterPlugin, PermitPlugin, Plugin, PostBindPlugin, PostFilterPlugin,
    PostFilterResult, PreBindPlugin, PreEnqueuePlugin, PreFilterPlugin, PreFilterResult, PreScorePlugin,
    QueueSortPlugin, ReservePlugin, ScoreExtensions, ScorePlugin, Status, Subject, Target, TargetScore,
    TargetToStatus,
};
use crate::resultstore::{ResultStore, PASSED_FILTER_MESSAGE, SUCCESS_MESSAGE, WAIT_MESSAGE};

/// Suffix appended to the original plugin name to form the wrapped plugin's name.
pub const WRAPPED_SUFFIX: &str = "Wrapped";

/// Name under which the wrapper of plugin `name` is registered.
pub fn wrapped_name(name: &str) -> String {
    format!("{}{}", name, WRAPPED_SUFFIX)
}

/// Optional knobs for [`WrappedPlugin::new`].
#[derive(Clone, Default)]
pub struct WrapOptions {
    pub extenders: Option<ExtenderInitializer>,
    /// Replaces the default `<original>Wrapped` display name.
    pub name_override: Option<String>,
    /// Weight used for final scores instead of the store's weight table.
    pub weight_override: Option<i64>,
}

impl WrapOptions {
    pub fn with_extenders(mut self, init: ExtenderInitializer) -> Self {
        self.extenders = Some(init);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name_override = Some(name.into());
        self
    }

    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight_override = Some(weight);
        self
    }
}

/// Capability handles of the original plugin, queried once at construction.
#[derive(Default)]
struct Capabilities {
    pre_enqueue: Option<Arc<dyn PreEnqueuePlugin>>,
    queue_sort: Option<Arc<dyn QueueSortPlugin>>,
    pre_filter: Option<Arc<dyn PreFilterPlugin>>,
    filter: Option<Arc<dyn FilterPlugin>>,
    post_filter: Option<Arc<dyn PostFilterPlugin>>,
    pre_score: Option<Arc<dyn PreScorePlugin>>,
    score: Option<Arc<dyn ScorePlugin>>,
    reserve: Option<Arc<dyn ReservePlugin>>,
    permit: Option<Arc<dyn PermitPlugin>>,
    pre_bind: Option<Arc<dyn PreBindPlugin>>,
    bind: Option<Arc<dyn BindPlugin>>,
    post_bind: Option<Arc<dyn PostBindPlugin>>,
}

impl Capabilities {
    fn query(original: &Arc<dyn Plugin>) -> Self {
        Self {
            pre_enqueue: original.clone().as_pre_enqueue(),
            queue_sort: original.clone().as_queue_sort(),
            pre_filter: original.clone().as_pre_filter(),
            filter: original.clone().as_filter(),
            post_filter: original.clone().as_post_filter(),
            pre_score: original.clone().as_pre_score(),
            score: original.clone().as_score(),
            reserve: original.clone().as_reserve(),
            permit: original.clone().as_permit(),
            pre_bind: original.clone().as_pre_bind(),
            bind: original.clone().as_bind(),
            post_bind: original.clone().as_post_bind(),
        }
    }

    fn set(&self) -> CapabilitySet {
        CapabilitySet {
            pre_enqueue: self.pre_enqueue.is_some(),
            queue_sort: self.queue_sort.is_some(),
            pre_filter: self.pre_filter.is_some(),
            filter: self.filter.is_some(),
            post_filter: self.post_filter.is_some(),
            pre_score: self.pre_score.is_some(),
            score: self.score.is_some(),
            normalize_score: self
                .score
                .as_ref()
                .map(|s| s.score_extensions().is_some())
                .unwrap_or(false),
            reserve: self.reserve.is_some(),
            permit: self.permit.is_some(),
            pre_bind: self.pre_bind.is_some(),
            bind: self.bind.is_some(),
            post_bind: self.post_bind.is_some(),
        }
    }
}

/// Which capabilities the wrapped original implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    pub pre_enqueue: bool,
    pub queue_sort: bool,
    pub pre_filter: bool,
    pub filter: bool,
    pub post_filter: bool,
    pub pre_score: bool,
    pub score: bool,
    pub normalize_score: bool,
    pub reserve: bool,
    pub permit: bool,
    pub pre_bind: bool,
    pub bind: bool,
    pub post_bind: bool,
}

/// Behaves like the original plugin while recording what it did.
pub struct WrappedPlugin {
    name: String,
    /// Results are recorded under this name, not under `name`.
    original_name: String,
    store: Arc<ResultStore>,
    caps: Capabilities,
    extenders: PluginExtenders,
    weight_override: Option<i64>,
}

impl WrappedPlugin {
    pub fn new(store: Arc<ResultStore>, original: Arc<dyn Plugin>, options: WrapOptions) -> Self {
        let original_name = original.name().to_string();
        let name = options
            .name_override
            .unwrap_or_else(|| wrapped_name(&original_name));

        let extenders = match options.extenders {
            Some(init) => {
                let handle: Arc<dyn SimulatorHandle> = store.clone();
                init(handle)
            }
            None => PluginExtenders::default(),
        };

        let caps = Capabilities::query(&original);
        debug!(plugin = %name, original = %original_name, "Wrapped plugin: {:?}", caps.set());

        Self {
            name,
            original_name,
            store,
            caps,
            extenders,
            weight_override: options.weight_override,
        }
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.caps.set()
    }

    /// Once the pipeline run is cancelled nothing more is recorded for it.
    fn should_record(&self, ctx: &CycleContext, stage: &str) -> bool {
        if ctx.is_cancelled() {
            debug!(plugin = %self.original_name, stage, "Cycle cancelled, not recording result");
            return false;
        }
        true
    }
}

fn outcome_message(status: &Status, success: &str) -> String {
    if status.is_success() {
        success.to_string()
    } else {
        status.message()
    }
}

impl PreEnqueuePlugin for WrappedPlugin {
    fn pre_enqueue(&self, subject: &Subject) -> Status {
        match &self.caps.pre_enqueue {
            Some(original) => original.pre_enqueue(subject),
            None => Status::success(),
        }
    }
}

impl QueueSortPlugin for WrappedPlugin {
    fn less(&self, a: &Subject, b: &Subject) -> bool {
        match &self.caps.queue_sort {
            Some(original) => original.less(a, b),
            None => false,
        }
    }
}

impl PreFilterPlugin for WrappedPlugin {
    fn pre_filter(&self, ctx: &CycleContext, subject: &Subject) -> (Option<PreFilterResult>, Status) {
        let Some(original) = &self.caps.pre_filter else {
            return (None, Status::success());
        };

        if let Some(ext) = &self.extenders.pre_filter {
            let (result, status) = ext.before_pre_filter(ctx, subject);
            if !status.is_success() {
                return (result, status);
            }
        }

        let (result, status) = original.pre_filter(ctx, subject);
        if self.should_record(ctx, "pre_filter") {
            self.store.add_pre_filter_result(
                &subject.namespace,
                &subject.name,
                &self.original_name,
                &outcome_message(&status, SUCCESS_MESSAGE),
                result.as_ref(),
            );
        }

        match &self.extenders.pre_filter {
            Some(ext) => ext.after_pre_filter(ctx, subject, result, status),
            None => (result, status),
        }
    }
}

impl FilterPlugin for WrappedPlugin {
    fn filter(&self, ctx: &CycleContext, subject: &Subject, target: &Target) -> Status {
        let Some(original) = &self.caps.filter else {
            return Status::success();
        };

        if let Some(ext) = &self.extenders.filter {
            let status = ext.before_filter(ctx, subject, target);
            if !status.is_success() {
                return status;
            }
        }

        let status = original.filter(ctx, subject, target);
        if self.should_record(ctx, "filter") {
            self.store.add_filter_result(
                &subject.namespace,
                &subject.name,
                &target.name,
                &self.original_name,
                &outcome_message(&status, PASSED_FILTER_MESSAGE),
            );
        }

        match &self.extenders.filter {
            Some(ext) => ext.after_filter(ctx, subject, target, status),
            None => status,
        }
    }
}

impl PostFilterPlugin for WrappedPlugin {
    fn post_filter(
        &self,
        ctx: &CycleContext,
        subject: &Subject,
        filtered: &TargetToStatus,
    ) -> (Option<PostFilterResult>, Status) {
        let Some(original) = &self.caps.post_filter else {
            // lets the pipeline move on to its next post-filter plugin
            return (None, Status::with_code(Code::Unschedulable));
        };

        if let Some(ext) = &self.extenders.post_filter {
            let (result, status) = ext.before_post_filter(ctx, subject, filtered);
            if !status.is_success() {
                return (result, status);
            }
        }

        let (result, status) = original.post_filter(ctx, subject, filtered);
        if self.should_record(ctx, "post_filter") {
            let nominated = match (&result, status.is_success()) {
                (Some(r), true) => r.nominated_target.as_str(),
                _ => "",
            };
            let mut targets: Vec<String> = filtered.keys().cloned().collect();
            targets.sort();
            self.store
                .add_post_filter_result(&subject.namespace, &subject.name, nominated, &self.original_name, &targets);
        }

        match &self.extenders.post_filter {
            Some(ext) => ext.after_post_filter(ctx, subject, filtered, result, status),
            None => (result, status),
        }
    }
}

impl PreScorePlugin for WrappedPlugin {
    fn pre_score(&self, ctx: &CycleContext, subject: &Subject, targets: &[Target]) -> Status {
        let Some(original) = &self.caps.pre_score else {
            return Status::success();
        };

        if let Some(ext) = &self.extenders.pre_score {
            let status = ext.before_pre_score(ctx, subject, targets);
            if !status.is_success() {
                return status;
            }
        }

        let status = original.pre_score(ctx, subject, targets);
        if self.should_record(ctx, "pre_score") {
            self.store.add_pre_score_result(
                &subject.namespace,
                &subject.name,
                &self.original_name,
                &outcome_message(&status, SUCCESS_MESSAGE),
            );
        }

        match &self.extenders.pre_score {
            Some(ext) => ext.after_pre_score(ctx, subject, targets, status),
            None => status,
        }
    }
}

impl ScorePlugin for WrappedPlugin {
    fn score(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> (i64, Status) {
        let Some(original) = &self.caps.score else {
            return (0, Status::success());
        };

        if let Some(ext) = &self.extenders.score {
            let (score, status) = ext.before_score(ctx, subject, target);
            if !status.is_success() {
                return (score, status);
            }
        }

        let (score, status) = original.score(ctx, subject, target);
        if !status.is_success() {
            error!(
                plugin = %self.original_name,
                "Score failed, not recording it: {}", status
            );
        } else if self.should_record(ctx, "score") {
            match self.weight_override {
                Some(weight) => self.store.add_score_result_with_weight(
                    &subject.namespace,
                    &subject.name,
                    target,
                    &self.original_name,
                    score,
                    weight,
                ),
                None => self
                    .store
                    .add_score_result(&subject.namespace, &subject.name, target, &self.original_name, score),
            }
        }

        match &self.extenders.score {
            Some(ext) => ext.after_score(ctx, subject, target, score, status),
            None => (score, status),
        }
    }

    fn score_extensions(&self) -> Option<&dyn ScoreExtensions> {
        let original = self.caps.score.as_ref()?;
        original.score_extensions()?;
        Some(self)
    }
}

impl ScoreExtensions for WrappedPlugin {
    fn normalize_score(&self, ctx: &CycleContext, subject: &Subject, scores: &mut [TargetScore]) -> Status {
        let Some(original) = self.caps.score.as_ref().and_then(|s| s.score_extensions()) else {
            return Status::success();
        };

        if let Some(ext) = &self.extenders.normalize_score {
            let status = ext.before_normalize_score(ctx, subject, scores);
            if !status.is_success() {
                return status;
            }
        }

        let status = original.normalize_score(ctx, subject, scores);
        if !status.is_success() {
            error!(
                plugin = %self.original_name,
                "Normalize score failed, not recording it: {}", status
            );
        } else if self.should_record(ctx, "normalize_score") {
            for s in scores.iter() {
                match self.weight_override {
                    Some(weight) => self.store.add_normalized_score_result_with_weight(
                        &subject.namespace,
                        &subject.name,
                        &s.name,
                        &self.original_name,
                        s.score,
                        weight,
                    ),
                    None => self.store.add_normalized_score_result(
                        &subject.namespace,
                        &subject.name,
                        &s.name,
                        &self.original_name,
                        s.score,
                    ),
                }
            }
        }

        match &self.extenders.normalize_score {
            Some(ext) => ext.after_normalize_score(ctx, subject, scores, status),
            None => status,
        }
    }
}

impl ReservePlugin for WrappedPlugin {
    fn reserve(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> Status {
        let Some(original) = &self.caps.reserve else {
            return Status::success();
        };

        if let Some(ext) = &self.extenders.reserve {
            let status = ext.before_reserve(ctx, subject, target);
            if !status.is_success() {
                return status;
            }
        }

        let status = original.reserve(ctx, subject, target);
        if self.should_record(ctx, "reserve") {
            // the pipeline only reserves the target it selected
            self.store.add_selected_target(&subject.namespace, &subject.name, target);
            self.store.add_reserve_result(
                &subject.namespace,
                &subject.name,
                &self.original_name,
                &outcome_message(&status, SUCCESS_MESSAGE),
            );
        }

        match &self.extenders.reserve {
            Some(ext) => ext.after_reserve(ctx, subject, target, status),
            None => status,
        }
    }

    fn unreserve(&self, ctx: &CycleContext, subject: &Subject, target: &str) {
        let Some(original) = &self.caps.reserve else {
            return;
        };

        if let Some(ext) = &self.extenders.reserve {
            let status = ext.before_unreserve(ctx, subject, target);
            if !status.is_success() {
                error!(
                    plugin = %self.original_name,
                    "Before-unreserve hook returned {}, skipping unreserve", status
                );
                return;
            }
        }

        original.unreserve(ctx, subject, target);

        if let Some(ext) = &self.extenders.reserve {
            ext.after_unreserve(ctx, subject, target);
        }
    }
}

impl PermitPlugin for WrappedPlugin {
    fn permit(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> (Status, Duration) {
        let Some(original) = &self.caps.permit else {
            return (Status::success(), Duration::ZERO);
        };

        if let Some(ext) = &self.extenders.permit {
            let (status, timeout) = ext.before_permit(ctx, subject, target);
            if !status.is_success() {
                return (status, timeout);
            }
        }

        let (status, timeout) = original.permit(ctx, subject, target);
        if self.should_record(ctx, "permit") {
            let msg = if status.is_wait() {
                WAIT_MESSAGE.to_string()
            } else {
                outcome_message(&status, SUCCESS_MESSAGE)
            };
            self.store
                .add_permit_result(&subject.namespace, &subject.name, &self.original_name, &msg, timeout);
        }

        match &self.extenders.permit {
            Some(ext) => ext.after_permit(ctx, subject, target, status, timeout),
            None => (status, timeout),
        }
    }
}

impl PreBindPlugin for WrappedPlugin {
    fn pre_bind(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> Status {
        let Some(original) = &self.caps.pre_bind else {
            return Status::success();
        };

        if let Some(ext) = &self.extenders.pre_bind {
            let status = ext.before_pre_bind(ctx, subject, target);
            if !status.is_success() {
                return status;
            }
        }

        let status = original.pre_bind(ctx, subject, target);
        if self.should_record(ctx, "pre_bind") {
            self.store.add_pre_bind_result(
                &subject.namespace,
                &subject.name,
                &self.original_name,
                &outcome_message(&status, SUCCESS_MESSAGE),
            );
        }

        match &self.extenders.pre_bind {
            Some(ext) => ext.after_pre_bind(ctx, subject, target, status),
            None => status,
        }
    }
}

impl BindPlugin for WrappedPlugin {
    fn bind(&self, ctx: &CycleContext, subject: &Subject, target: &str) -> Status {
        let Some(original) = &self.caps.bind else {
            // lets the next bind plugin take over
            return Status::new(Code::Skip, "wrapped plugin does not bind");
        };

        if let Some(ext) = &self.extenders.bind {
            let status = ext.before_bind(ctx, subject, target);
            if !status.is_success() {
                return status;
            }
        }

        let status = original.bind(ctx, subject, target);
        if self.should_record(ctx, "bind") {
            self.store.add_bind_result(
                &subject.namespace,
                &subject.name,
                &self.original_name,
                &outcome_message(&status, SUCCESS_MESSAGE),
            );
        }

        match &self.extenders.bind {
            Some(ext) => ext.after_bind(ctx, subject, target, status),
            None => status,
        }
    }
}

impl PostBindPlugin for WrappedPlugin {
    fn post_bind(&self, ctx: &CycleContext, subject: &Subject, target: &str) {
        let Some(original) = &self.caps.post_bind else {
            return;
        };

        if let Some(ext) = &self.extenders.post_bind {
            let status = ext.before_post_bind(ctx, subject, target);
            if !status.is_success() {
                error!(
                    plugin = %self.original_name,
                    "Before-post-bind hook returned {}, skipping post-bind", status
                );
                return;
            }
        }

        original.post_bind(ctx, subject, target);

        if let Some(ext) = &self.extenders.post_bind {
            ext.after_post_bind(ctx, subject, target);
        }
    }
}

impl Plugin for WrappedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_pre_enqueue(self: Arc<Self>) -> Option<Arc<dyn PreEnqueuePlugin>> {
        Some(self)
    }
    /// Only one queue-sort plugin may exist per profile, so this one is exposed
    /// solely when the original sorts.
    fn as_queue_sort(self: Arc<Self>) -> Option<Arc<dyn QueueSortPlugin>> {
        if self.caps.queue_sort.is_some() {
            Some(self)
        } else {
            None
        }
    }
    fn as_pre_filter(self: Arc<Self>) -> Option<Arc<dyn PreFilterPlugin>> {
        Some(self)
    }
    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        Some(self)
    }
    fn as_post_filter(self: Arc<Self>) -> Option<Arc<dyn PostFilterPlugin>> {
        Some(self)
    }
    fn as_pre_score(self: Arc<Self>) -> Option<Arc<dyn PreScorePlugin>> {
        Some(self)
    }
    fn as_score(self: Arc<Self>) -> Option<Arc<dyn ScorePlugin>> {
        Some(self)
    }
    fn as_reserve(self: Arc<Self>) -> Option<Arc<dyn ReservePlugin>> {
        Some(self)
    }
    fn as_permit(self: Arc<Self>) -> Option<Arc<dyn PermitPlugin>> {
        Some(self)
    }
    fn as_pre_bind(self: Arc<Self>) -> Option<Arc<dyn PreBindPlugin>> {
        Some(self)
    }
    fn as_bind(self: Arc<Self>) -> Option<Arc<dyn BindPlugin>> {
        Some(self)
    }
    fn as_post_bind(self: Arc<Self>) -> Option<Arc<dyn PostBindPlugin>> {
        Some(self)
    }
}

impl std::fmt::Debug for WrappedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedPlugin")
            .field("name", &self.name)
            .field("original_name", &self.original_name)
            .field("capabilities", &self.caps.set())
            .field("extenders", &self.extenders)
            .field("weight_override", &self.weight_override)
            .finish()
    }
}
