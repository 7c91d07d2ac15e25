//! Capability seam: the only shape the executor knows about step workers.
//!
//! A capability is built per invocation by a factory receiving the result
//! bus and the step's opaque config, then run once on the gathered inputs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use cvegenie_bus::ResultBus;
use serde_json::Value;

use crate::plan::StepConfig;

/// Named values flowing between steps.
pub type Artifacts = BTreeMap<String, Value>;

/// Unit of work behind a plan step.
pub trait Capability: Send {
    /// Run on the gathered inputs and return a map of produced outputs.
    fn execute(&mut self, inputs: &Artifacts) -> anyhow::Result<Artifacts>;
}

/// Builds a fresh capability instance for one invocation.
pub type CapabilityFactory =
    Arc<dyn Fn(Arc<dyn ResultBus>, &StepConfig) -> Box<dyn Capability> + Send + Sync>;

/// Adapter turning a closure into a [`Capability`].
pub struct FnCapability<F>(pub F);

impl<F> Capability for FnCapability<F>
where
    F: FnMut(&Artifacts) -> anyhow::Result<Artifacts> + Send,
{
    fn execute(&mut self, inputs: &Artifacts) -> anyhow::Result<Artifacts> {
        (self.0)(inputs)
    }
}

/// Errors raised while populating a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cannot alias {alias} to unregistered implementation {target}")]
    UnknownTarget { alias: String, target: String },
}

/// Implementation name -> factory lookup, populated at startup.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    factories: HashMap<String, CapabilityFactory>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(Arc<dyn ResultBus>, &StepConfig) -> Box<dyn Capability> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Register a stateless closure that ignores bus and config.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Artifacts) -> anyhow::Result<Artifacts> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |_bus, _config| {
            let f = Arc::clone(&f);
            Box::new(FnCapability(move |inputs: &Artifacts| f(inputs))) as Box<dyn Capability>
        })
    }

    /// Make `alias` resolve to the factory currently registered as `target`.
    pub fn register_alias(
        &mut self,
        alias: impl Into<String>,
        target: &str,
    ) -> Result<&mut Self, RegistryError> {
        let alias = alias.into();
        let factory = self
            .factories
            .get(target)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTarget {
                alias: alias.clone(),
                target: target.to_string(),
            })?;
        self.factories.insert(alias, factory);
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<CapabilityFactory> {
        self.factories.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("implementations", &self.names())
            .finish()
    }
}
