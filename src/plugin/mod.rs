//! Plugins: command registries paired with activation predicates
//!
//! A plugin is a [`Wrapper`]: one [`Registry`] plus the [`ContextPredicate`]
//! deciding when its commands are live. Plugins are selected by name, from
//! the built-in catalog or from `[[plugins]]` tables in the config file.
//!
//! # Built-in plugins
//!
//! - **basic**: key chords, typing, alerts
//! - **math**: spoken arithmetic ("solve two plus three")
//! - **control**: worker restart requests
//! - **yes** / **no**: always and never active samples
//! - **terminal**: active while a Terminator window has focus
//! - **turtle**: active while the Python turtle window has focus

mod basic;
mod control;
mod declared;
mod math;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::context::{Always, ContextPredicate};
use crate::executor::{Action, ActionExecutor};
use crate::grammar::registry::combine_registries;
use crate::grammar::{Arg, Handler, Registry};

/// Names accepted by [`builtin`]
pub const BUILTIN: &[&str] = &["basic", "math", "control", "yes", "no", "terminal", "turtle"];

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unknown plugin `{0}`")]
    Unknown(String),

    #[error("plugin `{plugin}`: pattern `{pattern}` has unsupported action `{action}`")]
    Action {
        plugin: String,
        pattern: String,
        action: String,
    },
}

/// A plugin's registry and the predicate that activates it
#[derive(Debug, Clone)]
pub struct Wrapper {
    pub name: String,
    pub registry: Arc<Registry>,
    pub context: Arc<dyn ContextPredicate>,
}

impl Wrapper {
    pub fn new(name: &str, registry: Registry, context: Arc<dyn ContextPredicate>) -> Self {
        Self {
            name: name.to_string(),
            registry: Arc::new(registry),
            context,
        }
    }

    /// A wrapper that is active for every message
    pub fn always(name: &str, registry: Registry) -> Self {
        Self::new(name, registry, Arc::new(Always))
    }
}

/// Wrappers considered together, in load order
#[derive(Debug, Clone, Default)]
pub struct WrapperGroup {
    pub wrappers: Vec<Wrapper>,
}

impl WrapperGroup {
    pub fn names(&self) -> Vec<&str> {
        self.wrappers.iter().map(|w| w.name.as_str()).collect()
    }

    /// Merge every wrapper's registry; later wrappers win on duplicates.
    pub fn registry(&self) -> Registry {
        combine_registries(self.wrappers.iter().map(|w| w.registry.as_ref()))
    }
}

/// A handler that turns its arguments into one action and performs it
pub(crate) fn action_handler<F>(name: &str, executor: &Arc<dyn ActionExecutor>, make: F) -> Handler
where
    F: Fn(Vec<Arg>) -> anyhow::Result<Action> + Send + Sync + 'static,
{
    let executor = executor.clone();
    Handler::new(name, move |args| {
        let executor = executor.clone();
        let action = make(args);
        async move {
            executor.execute(action?).await?;
            Ok(())
        }
    })
}

/// Arguments joined by single spaces
pub(crate) fn joined(args: &[Arg]) -> String {
    args.iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A built-in plugin by name.
pub fn builtin(name: &str, executor: &Arc<dyn ActionExecutor>) -> Option<Wrapper> {
    Some(match name {
        "basic" => basic::basic(executor),
        "math" => math::math(executor),
        "control" => control::control(),
        "yes" => basic::yes(executor),
        "no" => basic::no(executor),
        "terminal" => basic::terminal(executor),
        "turtle" => basic::turtle(executor),
        _ => return None,
    })
}

/// Resolve one plugin name, preferring a config-declared plugin.
pub fn resolve(
    name: &str,
    config: &Config,
    executor: &Arc<dyn ActionExecutor>,
) -> Result<Wrapper, PluginError> {
    if let Some(declared) = config.plugin(name) {
        return declared::from_config(declared, executor);
    }
    builtin(name, executor).ok_or_else(|| PluginError::Unknown(name.to_string()))
}

/// Load the named plugins in order, skipping any that fail.
///
/// An empty `names` list loads the configured default set.
pub fn load(names: &[String], config: &Config, executor: &Arc<dyn ActionExecutor>) -> WrapperGroup {
    let names = if names.is_empty() {
        &config.manager.plugins
    } else {
        names
    };

    let mut wrappers = Vec::with_capacity(names.len());
    for name in names {
        match resolve(name, config, executor) {
            Ok(wrapper) => {
                debug!(plugin = %name, patterns = wrapper.registry.pattern_to_handler.len(), "plugin loaded");
                wrappers.push(wrapper);
            }
            Err(e) => warn!(error = %e, "skipping plugin"),
        }
    }
    WrapperGroup { wrappers }
}
