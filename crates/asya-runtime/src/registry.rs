// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handler discovery by symbolic name.

use crate::handler::Handler;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Factory producing one handler instance from its (possibly null) config.
pub type HandlerFactory =
    Arc<dyn Fn(&Value) -> Result<Arc<dyn Handler>, RegistryError> + Send + Sync>;

/// Errors from handler resolution.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No factory registered under the requested name.
    #[error("unknown handler '{name}'; registered handlers: {known:?}")]
    UnknownHandler {
        /// Requested symbolic name.
        name: String,
        /// Every registered name, for the error message.
        known: Vec<String>,
    },

    /// The factory itself failed (bad config, missing model file, ...).
    #[error("handler '{name}' failed to initialize: {reason}")]
    InitFailed {
        /// Symbolic name of the failing handler.
        name: String,
        /// What the factory reported.
        reason: String,
    },
}

/// Registry of handler factories keyed by dotted symbolic names
/// (`module.function` / `module.Class.method` shape).
///
/// Resolution happens once at process start; the resulting instance serves
/// every envelope, so constructors can afford expensive setup. Unknown
/// names are rejected loudly with the full list of known names.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a symbolic name. Later registrations under
    /// the same name replace earlier ones.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Handler>, RegistryError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Convenience registration for handlers with a `Default`-style
    /// constructor that ignores config.
    pub fn register_instance(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.register(name, move |_| Ok(handler.clone()));
    }

    /// Instantiate the named handler once.
    pub fn instantiate(
        &self,
        name: &str,
        config: &Value,
    ) -> Result<Arc<dyn Handler>, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::UnknownHandler {
                name: name.to_string(),
                known: self.names(),
            })?;
        factory(config)
    }

    /// Every registered name, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}
