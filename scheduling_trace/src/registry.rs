//! Plugin factories, and the wrapping of a registry so every plugin it builds
//! records its results.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::extender::ExtenderInitializer;
use crate::framework::Plugin;
use crate::resultstore::{ResultStore, ScoreWeights, WeightSource};
use crate::wrapped::{wrapped_name, WrapOptions, WrappedPlugin, WRAPPED_SUFFIX};

/// Free-form plugin configuration.
pub type PluginArgs = serde_json::Value;

pub type PluginFactory = Arc<dyn Fn(&PluginArgs) -> Result<Arc<dyn Plugin>> + Send + Sync>;

/// Named plugin factories.
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, PluginFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: PluginFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(anyhow!("plugin {} is already registered", name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.factories.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn instantiate(&self, name: &str, args: &PluginArgs) -> Result<Arc<dyn Plugin>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("registry for {} is not found", name))?;
        factory(args).with_context(|| format!("create plugin {}", name))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// Builds a registry with one wrapping factory per enabled plugin, registered under
/// [`wrapped_name`]. Each factory creates the original plugin and wraps it with the
/// extenders registered for the original name. Names enabled twice are wrapped once.
pub fn wrap_registry(
    store: Arc<ResultStore>,
    originals: &Registry,
    enabled: &[String],
    extenders: &HashMap<String, ExtenderInitializer>,
) -> Result<Registry> {
    let mut wrapped = Registry::new();

    for name in enabled {
        let wrapped_key = wrapped_name(name);
        if wrapped.contains(&wrapped_key) {
            continue;
        }

        let original = originals
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("registry for {} is not found", name))?;
        let extender = extenders.get(name).cloned();
        let store = store.clone();
        let plugin_name = name.clone();

        let factory: PluginFactory = Arc::new(move |args: &PluginArgs| {
            let plugin = original(args).with_context(|| format!("create original plugin {}", plugin_name))?;
            let options = WrapOptions {
                extenders: extender.clone(),
                ..Default::default()
            };
            let plugin: Arc<dyn Plugin> = Arc::new(WrappedPlugin::new(store.clone(), plugin, options));
            Ok(plugin)
        });

        debug!("Registering {}", wrapped_key);
        wrapped.register(wrapped_key, factory)?;
    }

    info!("Wrapped {} plugins", wrapped.len());
    Ok(wrapped)
}

/// A plugin enabled in a profile, with its score weight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginWeight {
    pub name: String,
    #[serde(default)]
    pub weight: i64,
}

impl PluginWeight {
    pub fn new(name: impl Into<String>, weight: i64) -> Self {
        Self { name: name.into(), weight }
    }
}

/// Score-relevant part of a scheduling profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreProfile {
    /// Plugins enabled at the score stage.
    #[serde(default)]
    pub score: Vec<PluginWeight>,
    /// Plugins enabled at every stage they implement.
    #[serde(default)]
    pub multi_point: Vec<PluginWeight>,
}

impl ScoreProfile {
    /// Original names of every enabled plugin, in profile order.
    pub fn enabled_plugins(&self) -> Vec<String> {
        self.score
            .iter()
            .chain(&self.multi_point)
            .map(|p| p.name.strip_suffix(WRAPPED_SUFFIX).unwrap_or(&p.name).to_string())
            .collect()
    }
}

impl WeightSource for ScoreProfile {
    /// Weights keyed by original plugin name. A zero weight means "unset" and
    /// counts as one.
    fn score_weights(&self) -> ScoreWeights {
        self.score
            .iter()
            .chain(&self.multi_point)
            .map(|p| {
                let name = p.name.strip_suffix(WRAPPED_SUFFIX).unwrap_or(&p.name);
                let weight = if p.weight == 0 { 1 } else { p.weight };
                (name.to_string(), weight)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation;
    use crate::extender::{FilterExtender, PluginExtenders};
    use crate::framework::{CycleContext, FilterPlugin, Status, Subject, Target};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Gate;

    impl FilterPlugin for Gate {
        fn filter(&self, _ctx: &CycleContext, _subject: &Subject, _target: &Target) -> Status {
            Status::success()
        }
    }

    impl Plugin for Gate {
        fn name(&self) -> &str {
            "Gate"
        }
        fn as_filter(self: Arc<Self>) -> Option<Arc<dyn FilterPlugin>> {
            Some(self)
        }
    }

    fn originals(created: Arc<AtomicUsize>) -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                "Gate",
                Arc::new(move |_args: &PluginArgs| {
                    created.fetch_add(1, Ordering::SeqCst);
                    let plugin: Arc<dyn Plugin> = Arc::new(Gate);
                    Ok(plugin)
                }),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_score_profile_weights() {
        let profile = ScoreProfile {
            score: vec![PluginWeight::new("FitWrapped", 2), PluginWeight::new("Spread", 0)],
            multi_point: vec![PluginWeight::new("Affinity", 5)],
        };
        let weights = profile.score_weights();
        assert_eq!(weights.weight("Fit"), 2);
        assert_eq!(weights.weight("Spread"), 1);
        assert_eq!(weights.weight("Affinity"), 5);
        assert_eq!(weights.weight("Missing"), 0);
        assert_eq!(profile.enabled_plugins(), vec!["Fit", "Spread", "Affinity"]);
    }

    #[test]
    fn test_wrap_registry_dedups_and_wraps() {
        let created = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(ResultStore::new(ScoreWeights::default()));
        let enabled = vec!["Gate".to_string(), "Gate".to_string()];

        let wrapped = wrap_registry(store, &originals(created.clone()), &enabled, &HashMap::new()).unwrap();
        assert_eq!(wrapped.names().collect::<Vec<_>>(), vec!["GateWrapped"]);

        let plugin = wrapped.instantiate("GateWrapped", &PluginArgs::Null).unwrap();
        assert_eq!(plugin.name(), "GateWrapped");
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrap_registry_unknown_plugin() {
        let store = Arc::new(ResultStore::new(ScoreWeights::default()));
        let err = wrap_registry(store, &Registry::new(), &["Nope".to_string()], &HashMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "registry for Nope is not found");
    }

    #[test]
    fn test_wrapped_factory_attaches_extenders() {
        struct Stamp(Arc<dyn crate::extender::SimulatorHandle>);
        impl FilterExtender for Stamp {
            fn after_filter(&self, _ctx: &CycleContext, subject: &Subject, _target: &Target, status: Status) -> Status {
                self.0.add_custom_result(&subject.namespace, &subject.name, "example.com/stamped", "yes");
                status
            }
        }

        let store = Arc::new(ResultStore::new(ScoreWeights::default()));
        let init: ExtenderInitializer = Arc::new(|handle| PluginExtenders {
            filter: Some(Arc::new(Stamp(handle))),
            ..Default::default()
        });
        let extenders = HashMap::from([("Gate".to_string(), init)]);
        let wrapped = wrap_registry(
            store.clone(),
            &originals(Arc::new(AtomicUsize::new(0))),
            &["Gate".to_string()],
            &extenders,
        )
        .unwrap();

        let plugin = wrapped.instantiate("GateWrapped", &PluginArgs::Null).unwrap();
        let filter = plugin.as_filter().unwrap();
        filter.filter(&CycleContext::new(), &Subject::new("ns", "p"), &Target::new("node1"));

        let got = store.get_stored_result("ns", "p").unwrap();
        assert_eq!(got["example.com/stamped"], "yes");
        assert_eq!(got[annotation::FILTER], r#"{"node1":{"Gate":"passed"}}"#);
    }
}
