//! Publishes aggregated results onto the subject once its pipeline run completes.
//!
//! The reflector listens to a [`ChangeFeed`] of subject updates. For each update the
//! [`CompletionFilter`] accepts, it merges what every registered [`ResultSource`]
//! holds for the subject into the subject's annotations, persists it with
//! exponential backoff on conflicts and, once persisted, tells every source to drop
//! its record.
//!
//! Updates for one subject are expected to arrive one at a time from the feed; the
//! reflector does not de-duplicate them.

use anyhow::{bail, Context};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::annotation;
use crate::backoff::{retry_with_backoff, BackoffConfig};
use crate::framework::Subject;

/// Anything holding per-subject results that should end up on the subject.
pub trait ResultSource: Send + Sync {
    /// Annotation key → value pairs for the subject, `None` when there is nothing.
    fn get_stored_result(&self, subject: &Subject) -> Option<HashMap<String, String>>;
    /// Called once the results are durably applied.
    fn delete_data(&self, subject: &Subject);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("conflict updating {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Other(String),
}

impl PersistError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, PersistError::Conflict(_))
    }
}

/// Read/update access to persisted subjects.
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Subject, PersistError>;
    /// Fails with [`PersistError::Conflict`] when `subject` is stale.
    async fn update(&self, subject: Subject) -> Result<Subject, PersistError>;
}

/// A subject as it was before and after one update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectUpdate {
    pub old: Subject,
    pub new: Subject,
}

/// Source of subject updates. `None` means the feed is closed.
#[async_trait]
pub trait ChangeFeed: Send {
    async fn next(&mut self) -> Option<SubjectUpdate>;
}

#[async_trait]
impl ChangeFeed for mpsc::Receiver<SubjectUpdate> {
    async fn next(&mut self) -> Option<SubjectUpdate> {
        self.recv().await
    }
}

#[async_trait]
impl ChangeFeed for broadcast::Receiver<SubjectUpdate> {
    async fn next(&mut self) -> Option<SubjectUpdate> {
        loop {
            match self.recv().await {
                Ok(update) => return Some(update),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Change feed lagged, {} updates were dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Decides whether an update marks the end of a pipeline run.
pub type CompletionFilter = Arc<dyn Fn(&Subject, &Subject) -> bool + Send + Sync>;

/// Result of one [`Reflector::reflect`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectOutcome {
    /// Results were persisted and the sources' records deleted.
    Reflected,
    /// No source had anything for the subject.
    NothingToReflect,
    /// Persisting failed; the records stay in their sources.
    Failed,
}

/// Tally of a finished [`Reflector::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub reflected: usize,
    pub nothing_to_reflect: usize,
    pub failed: usize,
    /// Updates the completion filter turned down.
    pub ignored: usize,
}

impl RunSummary {
    fn count(&mut self, outcome: ReflectOutcome) {
        match outcome {
            ReflectOutcome::Reflected => self.reflected += 1,
            ReflectOutcome::NothingToReflect => self.nothing_to_reflect += 1,
            ReflectOutcome::Failed => self.failed += 1,
        }
    }
}

pub struct Reflector {
    sources: RwLock<BTreeMap<String, Arc<dyn ResultSource>>>,
    client: Arc<dyn PersistenceClient>,
    completion: CompletionFilter,
    backoff: BackoffConfig,
    limit: Arc<Semaphore>,
}

impl Reflector {
    pub const DEFAULT_MAX_CONCURRENT_REFLECTIONS: usize = 16;

    /// A reflector that reacts to every update.
    pub fn new(client: Arc<dyn PersistenceClient>) -> Self {
        Self {
            sources: RwLock::new(BTreeMap::new()),
            client,
            completion: Arc::new(|_, _| true),
            backoff: BackoffConfig::default(),
            limit: Arc::new(Semaphore::new(Self::DEFAULT_MAX_CONCURRENT_REFLECTIONS)),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bounds how many subjects are reflected at once. Zero is treated as one.
    pub fn with_max_concurrent_reflections(mut self, max: usize) -> Self {
        self.limit = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn with_completion_filter(mut self, filter: CompletionFilter) -> Self {
        self.completion = filter;
        self
    }

    /// Registers `source` under `key`, replacing any source already there.
    pub fn add_result_source(&self, key: impl Into<String>, source: Arc<dyn ResultSource>) {
        let key = key.into();
        if self.sources.write().insert(key.clone(), source).is_some() {
            warn!("Replaced result source {}", key);
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.read().len()
    }

    /// Consumes `feed` until it closes, reflecting every accepted update, then waits
    /// for the in-flight reflections.
    pub async fn run<F: ChangeFeed>(self: Arc<Self>, mut feed: F) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut tasks: JoinSet<ReflectOutcome> = JoinSet::new();
        info!("Reflector started with {} result sources", self.source_count());

        loop {
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record_join(&mut summary, joined);
                }
                update = feed.next() => {
                    let Some(update) = update else { break };
                    if !(self.completion)(&update.old, &update.new) {
                        summary.ignored += 1;
                        continue;
                    }
                    let permit = match self.limit.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            error!("Reflection limiter closed: {}", e);
                            break;
                        }
                    };
                    let this = self.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        this.reflect(&update.new).await
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record_join(&mut summary, joined);
        }
        info!("Reflector stopped: {:?}", summary);
        summary
    }

    /// Reflects the subject's stored results onto it.
    #[instrument(skip(self, subject), fields(subject = %subject.key()))]
    pub async fn reflect(&self, subject: &Subject) -> ReflectOutcome {
        let sources: Vec<Arc<dyn ResultSource>> = self.sources.read().values().cloned().collect();
        let updated = &AtomicBool::new(false);
        let sources = sources.as_slice();

        let result = retry_with_backoff(&self.backoff, || async move {
            self.try_reflect(subject, sources, updated).await
        })
        .await;

        if let Err(e) = result {
            error!("Failed to reflect scheduling results: {:#}", e);
            return ReflectOutcome::Failed;
        }
        if !updated.load(Ordering::SeqCst) {
            debug!("Nothing to reflect");
            return ReflectOutcome::NothingToReflect;
        }

        for source in sources {
            source.delete_data(subject);
        }
        debug!("Reflected scheduling results");
        ReflectOutcome::Reflected
    }

    /// One attempt. `Ok(false)` asks for a retry.
    async fn try_reflect(
        &self,
        subject: &Subject,
        sources: &[Arc<dyn ResultSource>],
        updated: &AtomicBool,
    ) -> anyhow::Result<bool> {
        // always start from the latest version so the update is not stale
        let mut latest = self
            .client
            .get(&subject.namespace, &subject.name)
            .await
            .with_context(|| format!("get subject {}", subject.key()))?;
        if latest.uid != subject.uid {
            bail!("subject UID changed: {} != {}", latest.uid, subject.uid);
        }

        let mut result_set = BTreeMap::new();
        for source in sources {
            if let Some(results) = source.get_stored_result(&latest) {
                result_set.extend(results);
            }
        }
        if result_set.is_empty() {
            return Ok(true);
        }

        latest
            .annotations
            .extend(result_set.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Err(e) = append_result_history(&mut latest.annotations, result_set) {
            error!("Cannot update {}: {:#}", annotation::RESULT_HISTORY, e);
        }

        match self.client.update(latest).await {
            Ok(_) => {
                updated.store(true, Ordering::SeqCst);
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!("Update conflicted, retrying: {}", e);
                Ok(false)
            }
            Err(e) => Err(e).context("update subject"),
        }
    }
}

fn record_join(summary: &mut RunSummary, joined: Result<ReflectOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => summary.count(outcome),
        Err(e) => {
            error!("Reflection task failed: {}", e);
            summary.failed += 1;
        }
    }
}

/// Appends `results` to the JSON array kept under the result-history annotation.
pub fn append_result_history(
    annotations: &mut BTreeMap<String, String>,
    results: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    let mut history: Vec<BTreeMap<String, String>> = match annotations.get(annotation::RESULT_HISTORY) {
        Some(raw) => serde_json::from_str(raw).context("decode result history")?,
        None => Vec::new(),
    };
    history.push(results);
    let encoded = serde_json::to_string(&history).context("encode result history")?;
    annotations.insert(annotation::RESULT_HISTORY.to_string(), encoded);
    Ok(())
}
