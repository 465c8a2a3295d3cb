//! Scheduling Trace - Core Library
//!
//! Records what every scheduler plugin decided for a subject during one pipeline
//! run and publishes the record as annotations on the subject once it is bound.
//!
//! Plugins are wrapped by [`WrappedPlugin`], which writes each stage's outcome into
//! a shared [`ResultStore`]. A [`Reflector`] watches subject updates and persists
//! the collected results with optimistic-concurrency retries.

pub mod annotation;
pub mod backoff;
pub mod cli;
pub mod demo;
pub mod extender;
pub mod framework;
pub mod inmemory;
pub mod reflector;
pub mod registry;
pub mod resultstore;
pub mod settings;
pub mod telemetry;
pub mod wrapped;

pub use backoff::{retry_with_backoff, BackoffConfig};
pub use extender::{ExtenderInitializer, PluginExtenders, SimulatorHandle};
pub use framework::{CycleContext, Plugin, Status, Subject, SubjectKey, Target};
pub use inmemory::InMemorySubjectStore;
pub use reflector::{PersistError, PersistenceClient, ReflectOutcome, Reflector, ResultSource, RunSummary};
pub use registry::{wrap_registry, Registry, ScoreProfile};
pub use resultstore::{ResultStore, ScoreWeights};
pub use settings::Settings;
pub use wrapped::{WrapOptions, WrappedPlugin};
