//! Before/after hooks that run around a wrapped plugin's stage methods.
//!
//! A `before_*` hook returning a non-success status short-circuits the stage: its
//! output is returned as-is, the original plugin is not called and nothing is
//! recorded. An `after_*` hook receives the original output and decides the final one.
//! Every hook defaults to a pass-through so an extender only overrides what it needs.

use std::sync::Arc;
use std::time::Duration;

use crate::framework::{
    CycleContext, PostFilterResult, PreFilterResult, Status, Subject, Target, TargetScore, TargetToStatus,
};

/// What an extender may do to the simulator while a plugin runs.
pub trait SimulatorHandle: Send + Sync {
    /// Publishes `value` under `annotation_key` on the subject once it is reflected.
    fn add_custom_result(&self, namespace: &str, name: &str, annotation_key: &str, value: &str);
}

pub trait PreFilterExtender: Send + Sync {
    fn before_pre_filter(&self, _ctx: &CycleContext, _subject: &Subject) -> (Option<PreFilterResult>, Status) {
        (None, Status::success())
    }

    fn after_pre_filter(
        &self,
        _ctx: &CycleContext,
        _subject: &Subject,
        result: Option<PreFilterResult>,
        status: Status,
    ) -> (Option<PreFilterResult>, Status) {
        (result, status)
    }
}

pub trait FilterExtender: Send + Sync {
    fn before_filter(&self, _ctx: &CycleContext, _subject: &Subject, _target: &Target) -> Status {
        Status::success()
    }

    fn after_filter(&self, _ctx: &CycleContext, _subject: &Subject, _target: &Target, status: Status) -> Status {
        status
    }
}

pub trait PostFilterExtender: Send + Sync {
    fn before_post_filter(
        &self,
        _ctx: &CycleContext,
        _subject: &Subject,
        _filtered: &TargetToStatus,
    ) -> (Option<PostFilterResult>, Status) {
        (None, Status::success())
    }

    fn after_post_filter(
        &self,
        _ctx: &CycleContext,
        _subject: &Subject,
        _filtered: &TargetToStatus,
        result: Option<PostFilterResult>,
        status: Status,
    ) -> (Option<PostFilterResult>, Status) {
        (result, status)
    }
}

pub trait PreScoreExtender: Send + Sync {
    fn before_pre_score(&self, _ctx: &CycleContext, _subject: &Subject, _targets: &[Target]) -> Status {
        Status::success()
    }

    fn after_pre_score(&self, _ctx: &CycleContext, _subject: &Subject, _targets: &[Target], status: Status) -> Status {
        status
    }
}

pub trait ScoreExtender: Send + Sync {
    fn before_score(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) -> (i64, Status) {
        (0, Status::success())
    }

    fn after_score(
        &self,
        _ctx: &CycleContext,
        _subject: &Subject,
        _target: &str,
        score: i64,
        status: Status,
    ) -> (i64, Status) {
        (score, status)
    }
}

pub trait NormalizeScoreExtender: Send + Sync {
    fn before_normalize_score(&self, _ctx: &CycleContext, _subject: &Subject, _scores: &mut [TargetScore]) -> Status {
        Status::success()
    }

    fn after_normalize_score(
        &self,
        _ctx: &CycleContext,
        _subject: &Subject,
        _scores: &mut [TargetScore],
        status: Status,
    ) -> Status {
        status
    }
}

pub trait ReserveExtender: Send + Sync {
    fn before_reserve(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) -> Status {
        Status::success()
    }

    fn after_reserve(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str, status: Status) -> Status {
        status
    }

    /// A non-success status skips the original unreserve.
    fn before_unreserve(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) -> Status {
        Status::success()
    }

    fn after_unreserve(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) {}
}

pub trait PermitExtender: Send + Sync {
    fn before_permit(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) -> (Status, Duration) {
        (Status::success(), Duration::ZERO)
    }

    fn after_permit(
        &self,
        _ctx: &CycleContext,
        _subject: &Subject,
        _target: &str,
        status: Status,
        timeout: Duration,
    ) -> (Status, Duration) {
        (status, timeout)
    }
}

pub trait PreBindExtender: Send + Sync {
    fn before_pre_bind(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) -> Status {
        Status::success()
    }

    fn after_pre_bind(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str, status: Status) -> Status {
        status
    }
}

pub trait BindExtender: Send + Sync {
    fn before_bind(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) -> Status {
        Status::success()
    }

    fn after_bind(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str, status: Status) -> Status {
        status
    }
}

pub trait PostBindExtender: Send + Sync {
    /// A non-success status skips the original post-bind.
    fn before_post_bind(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) -> Status {
        Status::success()
    }

    fn after_post_bind(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) {}
}

/// The hooks attached to one wrapped plugin. Unset capabilities run unhooked.
#[derive(Clone, Default)]
pub struct PluginExtenders {
    pub pre_filter: Option<Arc<dyn PreFilterExtender>>,
    pub filter: Option<Arc<dyn FilterExtender>>,
    pub post_filter: Option<Arc<dyn PostFilterExtender>>,
    pub pre_score: Option<Arc<dyn PreScoreExtender>>,
    pub score: Option<Arc<dyn ScoreExtender>>,
    pub normalize_score: Option<Arc<dyn NormalizeScoreExtender>>,
    pub reserve: Option<Arc<dyn ReserveExtender>>,
    pub permit: Option<Arc<dyn PermitExtender>>,
    pub pre_bind: Option<Arc<dyn PreBindExtender>>,
    pub bind: Option<Arc<dyn BindExtender>>,
    pub post_bind: Option<Arc<dyn PostBindExtender>>,
}

impl PluginExtenders {
    pub fn is_empty(&self) -> bool {
        self.pre_filter.is_none()
            && self.filter.is_none()
            && self.post_filter.is_none()
            && self.pre_score.is_none()
            && self.score.is_none()
            && self.normalize_score.is_none()
            && self.reserve.is_none()
            && self.permit.is_none()
            && self.pre_bind.is_none()
            && self.bind.is_none()
            && self.post_bind.is_none()
    }
}

impl std::fmt::Debug for PluginExtenders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginExtenders")
            .field("pre_filter", &self.pre_filter.is_some())
            .field("filter", &self.filter.is_some())
            .field("post_filter", &self.post_filter.is_some())
            .field("pre_score", &self.pre_score.is_some())
            .field("score", &self.score.is_some())
            .field("normalize_score", &self.normalize_score.is_some())
            .field("reserve", &self.reserve.is_some())
            .field("permit", &self.permit.is_some())
            .field("pre_bind", &self.pre_bind.is_some())
            .field("bind", &self.bind.is_some())
            .field("post_bind", &self.post_bind.is_some())
            .finish()
    }
}

/// Builds a plugin's extenders once, handing them the simulator handle.
pub type ExtenderInitializer = Arc<dyn Fn(Arc<dyn SimulatorHandle>) -> PluginExtenders + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::Code;

    struct Veto;

    impl FilterExtender for Veto {
        fn before_filter(&self, _ctx: &CycleContext, _subject: &Subject, target: &Target) -> Status {
            Status::new(Code::Unschedulable, format!("{} vetoed", target.name))
        }
    }

    #[test]
    fn test_default_hooks_pass_through() {
        struct Noop;
        impl ScoreExtender for Noop {}

        let ctx = CycleContext::new();
        let subject = Subject::new("ns", "p");
        let (score, status) = Noop.before_score(&ctx, &subject, "node1");
        assert_eq!(score, 0);
        assert!(status.is_success());

        let (score, status) = Noop.after_score(&ctx, &subject, "node1", 42, Status::with_code(Code::Error));
        assert_eq!(score, 42);
        assert_eq!(status.code(), Code::Error);
    }

    #[test]
    fn test_overridden_before_hook() {
        let ctx = CycleContext::new();
        let status = Veto.before_filter(&ctx, &Subject::new("ns", "p"), &Target::new("node1"));
        assert_eq!(status.message(), "node1 vetoed");
        // after keeps the default
        assert!(Veto
            .after_filter(&ctx, &Subject::new("ns", "p"), &Target::new("node1"), Status::success())
            .is_success());
    }

    #[test]
    fn test_plugin_extenders_is_empty() {
        let mut extenders = PluginExtenders::default();
        assert!(extenders.is_empty());
        extenders.filter = Some(Arc::new(Veto));
        assert!(!extenders.is_empty());
        assert!(format!("{:?}", extenders).contains("filter: true"));
    }
}
