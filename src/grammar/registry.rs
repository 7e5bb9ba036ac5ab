//! Per-plugin command registries
//!
//! A [`Registry`] maps patterns to handlers and names to reusable fragments.
//! Registries are built once when a plugin loads and only read afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;

/// One captured argument of a matched command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Arg {
    Text(String),
    Number(f64),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Text(text) => write!(f, "{text}"),
            Arg::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Returned by a handler to ask the supervising pool for a fresh worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Reload {
    /// Restart with the default plugin set
    #[error("restart requested")]
    Restart,
    /// Restart into the reduced, safe plugin set
    #[error("restart into safe plugins requested")]
    RestartSafe,
}

impl Reload {
    pub const RESTART_CODE: i32 = 3;
    pub const RESTART_SAFE_CODE: i32 = 4;

    pub fn exit_code(self) -> i32 {
        match self {
            Reload::Restart => Self::RESTART_CODE,
            Reload::RestartSafe => Self::RESTART_SAFE_CODE,
        }
    }

    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            Self::RESTART_CODE => Some(Reload::Restart),
            Self::RESTART_SAFE_CODE => Some(Reload::RestartSafe),
            _ => None,
        }
    }
}

type HandlerFn = dyn Fn(Vec<Arg>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// An async command handler
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    func: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F, Fut>(name: &str, func: F) -> Self
    where
        F: Fn(Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: Arc::from(name),
            func: Arc::new(move |args| func(args).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Arg>) -> anyhow::Result<()> {
        (self.func)(args).await
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.name).finish()
    }
}

/// Patterns and fragments contributed by one plugin
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub pattern_to_handler: BTreeMap<String, Handler>,
    pub definitions: BTreeMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `handler` to `pattern`, replacing any earlier handler for the
    /// same pattern. Returns the handler so it can be registered again.
    pub fn register(&mut self, pattern: &str, handler: Handler) -> Handler {
        self.pattern_to_handler
            .insert(pattern.to_string(), handler.clone());
        handler
    }

    /// Add or overwrite named fragments.
    pub fn define<I, K, V>(&mut self, fragments: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.definitions
            .extend(fragments.into_iter().map(|(k, v)| (k.into(), v.into())));
    }
}

/// Merge registries in order; later entries win on duplicate keys.
pub fn combine_registries<'a, I>(registries: I) -> Registry
where
    I: IntoIterator<Item = &'a Registry>,
{
    let mut combined = Registry::new();
    for registry in registries {
        for (pattern, handler) in &registry.pattern_to_handler {
            combined
                .pattern_to_handler
                .insert(pattern.clone(), handler.clone());
        }
        combined.define(
            registry
                .definitions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
    combined
}
