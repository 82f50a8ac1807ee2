//! Fetcher adapters: the uniform capability every upstream source implements.
//!
//! An adapter turns a query into a JSON payload or a typed [`FailureReason`].
//! Transport details, sessions and parsing stay inside the adapter; the
//! orchestrator only ever sees the outcome.

use crate::config::ConfigError;
use crate::query::QueryKey;
use crate::registry::{SourceRegistry, SourceSpec};
use crate::result::FailureReason;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// What one adapter call produces.
pub type AdapterOutcome = Result<Value, FailureReason>;

/// One upstream source.
///
/// Implementations should honor `source.timeout` for their own I/O and report
/// a query the upstream does not know as [`FailureReason::NotFound`], which
/// the orchestrator does not retry.
pub trait FetcherAdapter: Send + Sync {
    fn fetch(&self, key: &QueryKey, source: &SourceSpec) -> AdapterOutcome;
}

/// Adapter built from a closure returning `anyhow::Result`.
///
/// Errors that wrap a [`FailureReason`] keep it. Anything else is reported as
/// a transport error.
pub struct FnAdapter<F> {
    f: F,
}

impl<F> FnAdapter<F>
where
    F: Fn(&QueryKey) -> anyhow::Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> FetcherAdapter for FnAdapter<F>
where
    F: Fn(&QueryKey) -> anyhow::Result<Value> + Send + Sync,
{
    fn fetch(&self, key: &QueryKey, _source: &SourceSpec) -> AdapterOutcome {
        (self.f)(key).map_err(classify_error)
    }
}

/// Map an arbitrary error onto the failure taxonomy.
pub fn classify_error(err: anyhow::Error) -> FailureReason {
    match err.downcast::<FailureReason>() {
        Ok(reason) => reason,
        Err(other) => FailureReason::TransportError(format!("{other:#}")),
    }
}

/// Call an adapter, converting a panic into a transport failure.
pub fn invoke_guarded(
    adapter: &dyn FetcherAdapter,
    key: &QueryKey,
    source: &SourceSpec,
) -> AdapterOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| adapter.fetch(key, source))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(FailureReason::TransportError(format!(
            "adapter '{}' panicked: {}",
            source.name,
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Adapters registered by source name.
///
/// Cheap to clone: adapters are shared behind `Arc`.
#[derive(Clone, Default)]
pub struct AdapterMap {
    adapters: BTreeMap<String, Arc<dyn FetcherAdapter>>,
}

impl AdapterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the adapter for `source`.
    pub fn register(
        &mut self,
        source: impl Into<String>,
        adapter: impl FetcherAdapter + 'static,
    ) -> &mut Self {
        self.adapters.insert(source.into(), Arc::new(adapter));
        self
    }

    /// Register a closure adapter.
    pub fn register_fn<F>(&mut self, source: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&QueryKey) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(source, FnAdapter::new(f))
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, source: impl Into<String>, adapter: impl FetcherAdapter + 'static) -> Self {
        self.register(source, adapter);
        self
    }

    /// Builder form of [`register_fn`](Self::register_fn).
    pub fn with_fn<F>(mut self, source: impl Into<String>, f: F) -> Self
    where
        F: Fn(&QueryKey) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register_fn(source, f);
        self
    }

    pub fn get(&self, source: &str) -> Option<&Arc<dyn FetcherAdapter>> {
        self.adapters.get(source)
    }

    pub fn contains(&self, source: &str) -> bool {
        self.adapters.contains_key(source)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Startup check that every enabled source of `data_type` has an adapter.
    pub fn check_covers(&self, registry: &SourceRegistry, data_type: &str) -> Result<(), ConfigError> {
        let missing: Vec<String> = registry
            .enabled_sources(data_type)?
            .into_iter()
            .filter(|name| !self.contains(name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "data type '{data_type}' has no adapter for: {}",
                missing.join(", ")
            )))
        }
    }
}

impl fmt::Debug for AdapterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}
