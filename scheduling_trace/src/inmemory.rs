//! In-process subject store with optimistic concurrency and an update feed.
//!
//! Stands in for the orchestration layer's API server: the CLI demo and the
//! integration tests persist subjects here and feed its updates to the reflector.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::framework::{Subject, SubjectKey};
use crate::reflector::{PersistError, PersistenceClient, SubjectUpdate};

const DEFAULT_FEED_CAPACITY: usize = 1024;

pub struct InMemorySubjectStore {
    subjects: DashMap<SubjectKey, Subject>,
    /// `None` once the feed is closed.
    updates: RwLock<Option<broadcast::Sender<SubjectUpdate>>>,
    /// Number of upcoming updates to reject with a conflict.
    pending_conflicts: AtomicUsize,
    update_calls: AtomicUsize,
}

impl Default for InMemorySubjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySubjectStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    /// `capacity` bounds how far a feed subscriber may lag behind.
    pub fn with_capacity(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            subjects: DashMap::new(),
            updates: RwLock::new(Some(updates)),
            pending_conflicts: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Feed of every successful update made from now on. After [`close_feed`]
    /// the returned feed is already closed.
    ///
    /// [`close_feed`]: Self::close_feed
    pub fn subscribe(&self) -> broadcast::Receiver<SubjectUpdate> {
        match self.updates.read().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Stops publishing updates. Subscribers still receive what was already sent,
    /// then see the feed close.
    pub fn close_feed(&self) {
        if self.updates.write().take().is_some() {
            debug!("Closed subject update feed");
        }
    }

    /// Stores a new subject at resource version 1.
    pub fn create(&self, mut subject: Subject) -> Result<Subject, PersistError> {
        match self.subjects.entry(subject.key()) {
            Entry::Occupied(e) => Err(PersistError::Other(format!("{} already exists", e.key()))),
            Entry::Vacant(e) => {
                subject.resource_version = 1;
                e.insert(subject.clone());
                debug!(subject = %subject.key(), "Created subject");
                Ok(subject)
            }
        }
    }

    pub fn get_subject(&self, namespace: &str, name: &str) -> Option<Subject> {
        self.subjects
            .get(&SubjectKey::new(namespace, name))
            .map(|s| s.value().clone())
    }

    /// Makes the next `n` updates fail with a conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    /// Number of update attempts, rejected ones included.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Replaces the stored subject when `subject` carries its current resource
    /// version, then publishes the change.
    pub fn update_subject(&self, mut subject: Subject) -> Result<Subject, PersistError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let key = subject.key();
        if self.take_injected_conflict() {
            return Err(PersistError::Conflict(key.to_string()));
        }

        let old = {
            let mut current = self
                .subjects
                .get_mut(&key)
                .ok_or_else(|| PersistError::NotFound(key.to_string()))?;
            if current.uid != subject.uid || current.resource_version != subject.resource_version {
                return Err(PersistError::Conflict(key.to_string()));
            }
            subject.resource_version += 1;
            std::mem::replace(current.value_mut(), subject.clone())
        };

        debug!(subject = %key, version = subject.resource_version, "Updated subject");
        if let Some(tx) = self.updates.read().as_ref() {
            // no subscribers is fine
            let _ = tx.send(SubjectUpdate { old, new: subject.clone() });
        }
        Ok(subject)
    }
}

#[async_trait]
impl PersistenceClient for InMemorySubjectStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Subject, PersistError> {
        self.get_subject(namespace, name)
            .ok_or_else(|| PersistError::NotFound(SubjectKey::new(namespace, name).to_string()))
    }

    async fn update(&self, subject: Subject) -> Result<Subject, PersistError> {
        self.update_subject(subject)
    }
}
