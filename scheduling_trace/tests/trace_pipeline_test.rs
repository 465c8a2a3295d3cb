//! End-to-end tests: wrapped plugins record into the result store and the
//! reflector moves the records onto persisted subjects.

use proptest::prelude::*;
use scheduling_trace::annotation;
use scheduling_trace::demo::{self, ScheduleOutcome};
use scheduling_trace::extender::FilterExtender;
use scheduling_trace::framework::{Code, FilterPlugin, ScorePlugin};
use scheduling_trace::reflector::SubjectUpdate;
use scheduling_trace::resultstore::{PASSED_FILTER_MESSAGE, RESULT_STORE_KEY};
use scheduling_trace::{
    BackoffConfig, CycleContext, InMemorySubjectStore, Plugin, PluginExtenders, ReflectOutcome, Reflector,
    ResultStore, ScoreWeights, Settings, Status, Subject, Target, WrapOptions, WrappedPlugin,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_test::traced_test;

/* ------------ helpers -------------- */

struct Fit;

impl FilterPlugin for Fit {
    fn filter(&self, _ctx: &CycleContext, _subject: &Subject, _target: &Target) -> Status {
        Status::success()
    }
}

impl ScorePlugin for Fit {
    fn score(&self, _ctx: &CycleContext, _subject: &Subject, _target: &str) -> (i64, Status) {
        (10, Status::success())
    }
}

impl Plugin for Fit {
    fn name(&self) -> &str {
        "Fit"
    }
    fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
        Some(self)
    }
    fn as_score(self: Arc<Self>) -> Option<Arc<dyn ScorePlugin>> {
        Some(self)
    }
}

/// Implements no stage at all.
struct Idle;

impl Plugin for Idle {
    fn name(&self) -> &str {
        "Idle"
    }
}

fn store(weights: &[(&str, i64)]) -> Arc<ResultStore> {
    Arc::new(ResultStore::new(weights.iter().map(|(k, v)| (*k, *v)).collect::<ScoreWeights>()))
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_interval: Duration::from_millis(10),
        multiplier: 2.0,
        max_interval: Duration::from_millis(100),
        max_elapsed_time: Duration::from_secs(2),
    }
}

fn reflector(subjects: &Arc<InMemorySubjectStore>, results: &Arc<ResultStore>) -> Reflector {
    let reflector = Reflector::new(subjects.clone()).with_backoff(fast_backoff());
    reflector.add_result_source(RESULT_STORE_KEY, results.clone());
    reflector
}

/* ------------ result store -------------- */

#[test]
#[traced_test]
fn test_filter_result_through_wrapped_plugin() {
    let results = store(&[]);
    let wrapped = Arc::new(WrappedPlugin::new(results.clone(), Arc::new(Fit), WrapOptions::default()));

    let filter = wrapped.as_filter().expect("wrapped plugin always filters");
    let status = filter.filter(&CycleContext::new(), &Subject::new("default", "pod1"), &Target::new("node1"));
    assert!(status.is_success());

    let got = results.get_stored_result("default", "pod1").unwrap();
    assert_eq!(got[annotation::FILTER], r#"{"node1":{"Fit":"passed"}}"#);
    assert_eq!(got[annotation::SCORE], "{}");
    assert_eq!(got[annotation::SELECTED_TARGET], "");
}

#[test]
#[traced_test]
fn test_score_weight_through_wrapped_plugin() {
    let results = store(&[("Fit", 2)]);
    let wrapped = Arc::new(WrappedPlugin::new(results.clone(), Arc::new(Fit), WrapOptions::default()));

    let scorer = wrapped.as_score().unwrap();
    let (score, status) = scorer.score(&CycleContext::new(), &Subject::new("default", "pod1"), "node1");
    assert_eq!(score, 10);
    assert!(status.is_success());

    let got = results.get_stored_result("default", "pod1").unwrap();
    assert_eq!(got[annotation::SCORE], r#"{"node1":{"Fit":"10"}}"#);
    assert_eq!(got[annotation::FINAL_SCORE], r#"{"node1":{"Fit":"20"}}"#);
}

#[test]
fn test_non_capable_plugin_writes_nothing() {
    let results = store(&[("Idle", 1)]);
    let wrapped = Arc::new(WrappedPlugin::new(results.clone(), Arc::new(Idle), WrapOptions::default()));
    let ctx = CycleContext::new();
    let subject = Subject::new("ns", "p");

    let status = wrapped.clone().as_filter().unwrap().filter(&ctx, &subject, &Target::new("node1"));
    assert!(status.is_success());
    let (score, _) = wrapped.clone().as_score().unwrap().score(&ctx, &subject, "node1");
    assert_eq!(score, 0);
    assert!(wrapped.as_queue_sort().is_none());

    assert!(results.get_stored_result("ns", "p").is_none());
}

#[test]
fn test_before_hook_short_circuits_original() {
    struct Deny;
    impl FilterExtender for Deny {
        fn before_filter(&self, _ctx: &CycleContext, _subject: &Subject, _target: &Target) -> Status {
            Status::new(Code::Unschedulable, "denied by extender")
        }
    }

    let results = store(&[]);
    let init: scheduling_trace::ExtenderInitializer = Arc::new(|_handle| PluginExtenders {
        filter: Some(Arc::new(Deny)),
        ..Default::default()
    });
    let wrapped = Arc::new(WrappedPlugin::new(
        results.clone(),
        Arc::new(Fit),
        WrapOptions::default().with_extenders(init),
    ));

    let status = wrapped
        .as_filter()
        .unwrap()
        .filter(&CycleContext::new(), &Subject::new("ns", "p"), &Target::new("node1"));
    assert_eq!(status.code(), Code::Unschedulable);
    assert!(results.get_stored_result("ns", "p").is_none());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_concurrent_writers_lose_nothing(writers in 1usize..6, targets in 1usize..8) {
        let results = store(&[("Fit", 3)]);

        std::thread::scope(|scope| {
            for w in 0..writers {
                let results = &results;
                scope.spawn(move || {
                    let plugin = format!("Fit{}", w);
                    for t in 0..targets {
                        let target = format!("node{}", t);
                        results.add_filter_result("ns", "p", &target, &plugin, PASSED_FILTER_MESSAGE);
                        results.add_score_result_with_weight("ns", "p", &target, &plugin, t as i64, 3);
                    }
                });
            }
        });

        let got = results.get_stored_result("ns", "p").unwrap();
        let filter: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_str(&got[annotation::FILTER]).unwrap();
        let final_score: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_str(&got[annotation::FINAL_SCORE]).unwrap();

        prop_assert_eq!(filter.len(), targets);
        for t in 0..targets {
            let target = format!("node{}", t);
            prop_assert_eq!(filter[&target].len(), writers);
            for w in 0..writers {
                let plugin = format!("Fit{}", w);
                prop_assert_eq!(&final_score[&target][&plugin], &(t as i64 * 3).to_string());
            }
        }
    }
}

/* ------------ reflector -------------- */

#[tokio::test]
#[traced_test]
async fn test_reflect_applies_results_and_clears_store() {
    let subjects = Arc::new(InMemorySubjectStore::new());
    let results = store(&[("Fit", 1)]);
    let subject = subjects.create(Subject::new("default", "pod1")).unwrap();
    results.add_filter_result("default", "pod1", "node1", "Fit", PASSED_FILTER_MESSAGE);
    results.add_selected_target("default", "pod1", "node1");

    let outcome = reflector(&subjects, &results).reflect(&subject).await;
    assert_eq!(outcome, ReflectOutcome::Reflected);

    let persisted = subjects.get_subject("default", "pod1").unwrap();
    assert_eq!(persisted.annotations[annotation::FILTER], r#"{"node1":{"Fit":"passed"}}"#);
    assert_eq!(persisted.annotations[annotation::SELECTED_TARGET], "node1");
    let history: Vec<BTreeMap<String, String>> =
        serde_json::from_str(&persisted.annotations[annotation::RESULT_HISTORY]).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0][annotation::SELECTED_TARGET], "node1");
    assert!(results.is_empty());
    assert!(logs_contain("Reflected scheduling results"));
}

#[tokio::test(start_paused = true)]
async fn test_reflect_retries_conflicts() {
    let subjects = Arc::new(InMemorySubjectStore::new());
    let results = store(&[]);
    let subject = subjects.create(Subject::new("ns", "p")).unwrap();
    results.add_bind_result("ns", "p", "Binder", "success");
    subjects.inject_conflicts(2);

    let outcome = reflector(&subjects, &results).reflect(&subject).await;
    assert_eq!(outcome, ReflectOutcome::Reflected);
    assert_eq!(subjects.update_calls(), 3);
    assert_eq!(
        subjects.get_subject("ns", "p").unwrap().annotations[annotation::BIND],
        r#"{"Binder":"success"}"#
    );
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_exhausted_retries_keep_the_record() {
    let subjects = Arc::new(InMemorySubjectStore::new());
    let results = store(&[]);
    let subject = subjects.create(Subject::new("ns", "p")).unwrap();
    results.add_bind_result("ns", "p", "Binder", "success");
    subjects.inject_conflicts(usize::MAX);

    let outcome = reflector(&subjects, &results).reflect(&subject).await;
    assert_eq!(outcome, ReflectOutcome::Failed);
    assert!(results.get_stored_result("ns", "p").is_some());
    assert!(subjects.get_subject("ns", "p").unwrap().annotations.is_empty());
    assert!(logs_contain("Failed to reflect scheduling results"));
}

#[tokio::test]
async fn test_nothing_to_reflect_skips_update() {
    let subjects = Arc::new(InMemorySubjectStore::new());
    let results = store(&[]);
    let subject = subjects.create(Subject::new("ns", "p")).unwrap();

    let outcome = reflector(&subjects, &results).reflect(&subject).await;
    assert_eq!(outcome, ReflectOutcome::NothingToReflect);
    assert_eq!(subjects.update_calls(), 0);
}

#[tokio::test]
async fn test_uid_mismatch_fails_without_update() {
    let subjects = Arc::new(InMemorySubjectStore::new());
    let results = store(&[]);
    subjects.create(Subject::new("ns", "p")).unwrap();
    results.add_bind_result("ns", "p", "Binder", "success");

    // same key, different incarnation
    let stale = Subject::new("ns", "p");
    let outcome = reflector(&subjects, &results).reflect(&stale).await;
    assert_eq!(outcome, ReflectOutcome::Failed);
    assert_eq!(subjects.update_calls(), 0);
    assert!(results.get_stored_result("ns", "p").is_some());
}

#[tokio::test]
async fn test_run_reflects_many_subjects_concurrently() {
    let subjects = Arc::new(InMemorySubjectStore::new());
    let results = store(&[]);
    let created: Vec<Subject> = (0..8)
        .map(|i| subjects.create(Subject::new("ns", format!("p{}", i))).unwrap())
        .collect();
    for s in &created {
        results.add_selected_target(&s.namespace, &s.name, "node1");
    }

    let reflector = Arc::new(reflector(&subjects, &results).with_max_concurrent_reflections(3));
    let (tx, rx) = mpsc::channel(16);
    let running = tokio::spawn(reflector.clone().run(rx));
    for s in &created {
        tx.send(SubjectUpdate { old: s.clone(), new: s.clone() }).await.unwrap();
    }
    drop(tx);

    let summary = running.await.unwrap();
    assert_eq!(summary.reflected, 8);
    assert!(results.is_empty());

    // a second pass finds nothing left
    let again = futures::future::join_all(created.iter().map(|s| reflector.reflect(s))).await;
    assert!(again.iter().all(|o| *o == ReflectOutcome::NothingToReflect));
}

#[test]
fn test_reflect_from_a_blocking_caller() {
    let subjects = Arc::new(InMemorySubjectStore::new());
    let results = store(&[]);
    let subject = subjects.create(Subject::new("ns", "p")).unwrap();
    results.add_custom_result("ns", "p", "example.com/checked", "true");

    let outcome = tokio_test::block_on(reflector(&subjects, &results).reflect(&subject));
    assert_eq!(outcome, ReflectOutcome::Reflected);
    assert_eq!(
        subjects.get_subject("ns", "p").unwrap().annotations["example.com/checked"],
        "true"
    );
}

/* ------------ full pipeline -------------- */

#[tokio::test]
#[traced_test]
async fn test_demo_pipeline_reflects_every_bound_subject() {
    let settings = Settings::load().unwrap();
    let report = demo::run(&settings, "default", 4, 6).await.unwrap();

    let scheduled: Vec<&String> = report
        .outcomes
        .iter()
        .filter_map(|(key, outcome)| match outcome {
            ScheduleOutcome::Scheduled(_) => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled.len(), 4);
    assert_eq!(report.reflector.reflected, 4);
    assert_eq!(report.unreflected, 0);

    for (key, outcome) in &report.outcomes {
        let ScheduleOutcome::Scheduled(target) = outcome else { continue };
        let annotations = &report.annotations[key];
        assert_eq!(&annotations[annotation::SELECTED_TARGET], target);
        assert!(annotations[annotation::FILTER].contains("CapacityFit"));
        assert!(annotations.contains_key(annotation::RESULT_HISTORY));
    }

    // subject-3 carries the highest priority and has to wait at the permit stage
    let waited = &report.annotations["default/subject-3"];
    assert_eq!(waited[annotation::PERMIT], r#"{"AdmissionGate":"wait"}"#);
    assert_eq!(waited[annotation::PERMIT_TIMEOUT], r#"{"AdmissionGate":"10s"}"#);
}

#[tokio::test]
#[traced_test]
async fn test_unschedulable_subject_is_reflected() {
    let results = store(&[(demo::CapacityFit::NAME, 1)]);
    let subjects = Arc::new(InMemorySubjectStore::new());
    let plugin: Arc<dyn Plugin> = Arc::new(WrappedPlugin::new(
        results.clone(),
        Arc::new(demo::CapacityFit::new()),
        WrapOptions::default(),
    ));
    let pipeline = demo::Pipeline::new(&[plugin], results.weights().clone());

    let reflector = Arc::new(reflector(&subjects, &results).with_completion_filter(demo::completion_filter()));
    let running = tokio::spawn(reflector.run(subjects.subscribe()));

    let mut subject = Subject::new("ns", "huge");
    subject.annotations.insert(demo::REQUEST_ANNOTATION.to_string(), "1000".to_string());
    let outcomes = demo::schedule_all(
        &pipeline,
        &subjects,
        &fast_backoff(),
        vec![subject],
        &demo::sample_targets(3),
    )
    .await
    .unwrap();
    subjects.close_feed();
    let summary = running.await.unwrap();

    assert_eq!(outcomes[0].1, ScheduleOutcome::Unschedulable { nominated: None });
    assert_eq!(summary.reflected, 1);
    assert!(results.is_empty());

    let persisted = subjects.get_subject("ns", "huge").unwrap();
    assert_eq!(persisted.target, None);
    let condition = persisted.condition.unwrap();
    assert_eq!(condition.reason, "Unschedulable");
    assert_eq!(condition.attempts, 1);
    let filter: BTreeMap<String, BTreeMap<String, String>> =
        serde_json::from_str(&persisted.annotations[annotation::FILTER]).unwrap();
    assert_eq!(filter.len(), 3);
    assert!(filter.values().all(|by_plugin| by_plugin[demo::CapacityFit::NAME] == "insufficient capacity"));
    assert_eq!(persisted.annotations[annotation::SELECTED_TARGET], "");
}

#[test]
fn test_completion_filter_transitions() {
    let filter = demo::completion_filter();
    let fresh = Subject::new("ns", "p");

    let mut bound = fresh.clone();
    bound.target = Some("east-0".to_string());
    assert!(filter(&fresh, &bound));

    let mut failed = fresh.clone();
    failed.condition = Some(scheduling_trace::framework::SchedulingCondition {
        reason: "Unschedulable".to_string(),
        message: "no target fits".to_string(),
        attempts: 1,
    });
    assert!(filter(&fresh, &failed));

    // the reflector's own annotation update
    let mut annotated = failed.clone();
    annotated.annotations.insert(annotation::BIND.to_string(), "{}".to_string());
    assert!(!filter(&failed, &annotated));

    let mut failed_again = failed.clone();
    if let Some(c) = failed_again.condition.as_mut() {
        c.attempts = 2;
    }
    assert!(filter(&failed, &failed_again));
}
