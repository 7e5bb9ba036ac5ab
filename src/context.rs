//! Context predicates decide which plugins are active for a message
//!
//! Each [`Wrapper`] carries a predicate. Before compiling a grammar the worker
//! evaluates every predicate against a [`MessageContext`] and keeps only the
//! wrappers that pass. The focused window title is fetched lazily, at most
//! once per message, however many predicates ask for it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::plugin::{Wrapper, WrapperGroup};

/// Source of the currently focused window title
#[async_trait]
pub trait WindowTitleSource: Send + Sync {
    async fn focused_title(&self) -> Option<String>;
}

/// Reads the focused window title with `xdotool`
#[derive(Debug, Default, Clone, Copy)]
pub struct Xdotool;

#[async_trait]
impl WindowTitleSource for Xdotool {
    async fn focused_title(&self) -> Option<String> {
        let output = tokio::process::Command::new("xdotool")
            .args(["getwindowfocus", "getwindowname"])
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let title = String::from_utf8_lossy(&output.stdout);
                Some(title.trim_end_matches('\n').to_string())
            }
            Ok(output) => {
                warn!(status = %output.status, "xdotool could not read the window title");
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to run xdotool");
                None
            }
        }
    }
}

/// A title that never changes; `None` means "unknown"
#[derive(Debug, Default, Clone)]
pub struct FixedTitle(pub Option<String>);

#[async_trait]
impl WindowTitleSource for FixedTitle {
    async fn focused_title(&self) -> Option<String> {
        self.0.clone()
    }
}

/// The platform's window title source
pub fn default_title_source() -> Arc<dyn WindowTitleSource> {
    if cfg!(target_os = "linux") {
        Arc::new(Xdotool)
    } else {
        Arc::new(FixedTitle(None))
    }
}

/// Message-level facts predicates can inspect
pub struct MessageContext {
    pub transcript: String,
    titles: Arc<dyn WindowTitleSource>,
    title: OnceCell<Option<String>>,
}

impl MessageContext {
    pub fn new(transcript: &str, titles: Arc<dyn WindowTitleSource>) -> Self {
        Self {
            transcript: transcript.to_string(),
            titles,
            title: OnceCell::new(),
        }
    }

    /// Focused window title, queried on first use
    pub async fn window_title(&self) -> Option<&str> {
        self.title
            .get_or_init(|| self.titles.focused_title())
            .await
            .as_deref()
    }
}

/// An activation predicate for one plugin
#[async_trait]
pub trait ContextPredicate: Send + Sync + fmt::Debug {
    async fn check(&self, ctx: &MessageContext) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Always;

#[async_trait]
impl ContextPredicate for Always {
    async fn check(&self, _ctx: &MessageContext) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Never;

#[async_trait]
impl ContextPredicate for Never {
    async fn check(&self, _ctx: &MessageContext) -> bool {
        false
    }
}

/// Active while the focused window title contains the given text
#[derive(Debug, Clone)]
pub struct WindowTitleContains(pub String);

#[async_trait]
impl ContextPredicate for WindowTitleContains {
    async fn check(&self, ctx: &MessageContext) -> bool {
        ctx.window_title()
            .await
            .is_some_and(|title| title.contains(&self.0))
    }
}

async fn is_active(wrapper: &Wrapper, ctx: &MessageContext, limit: Duration) -> bool {
    match tokio::time::timeout(limit, wrapper.context.check(ctx)).await {
        Ok(active) => {
            debug!(plugin = %wrapper.name, active, "context checked");
            active
        }
        Err(_) => {
            warn!(
                plugin = %wrapper.name,
                timeout_ms = limit.as_millis() as u64,
                "context check timed out; plugin inactive for this message"
            );
            false
        }
    }
}

/// Keep the wrappers whose predicate passes, in their original order.
///
/// Each predicate is bounded by `limit`; one that runs out of time counts as
/// inactive.
pub async fn filter_wrappers(
    group: &WrapperGroup,
    ctx: &MessageContext,
    limit: Duration,
) -> WrapperGroup {
    let mut allowed = Vec::new();
    for wrapper in &group.wrappers {
        if is_active(wrapper, ctx, limit).await {
            allowed.push(wrapper.clone());
        }
    }
    WrapperGroup { wrappers: allowed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::grammar::Registry;

    fn wrapper(name: &str, context: Arc<dyn ContextPredicate>) -> Wrapper {
        Wrapper::new(name, Registry::new(), context)
    }

    fn ctx(title: Option<&str>) -> MessageContext {
        MessageContext::new("", Arc::new(FixedTitle(title.map(str::to_string))))
    }

    fn names(group: &WrapperGroup) -> Vec<&str> {
        group.wrappers.iter().map(|w| w.name.as_str()).collect()
    }

    #[derive(Debug)]
    struct Stalls;

    #[async_trait]
    impl ContextPredicate for Stalls {
        async fn check(&self, _ctx: &MessageContext) -> bool {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            true
        }
    }

    struct CountingTitles(AtomicUsize);

    #[async_trait]
    impl WindowTitleSource for CountingTitles {
        async fn focused_title(&self) -> Option<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some("~/src - Terminator".to_string())
        }
    }

    #[tokio::test]
    async fn test_always_and_never() {
        let group = WrapperGroup {
            wrappers: vec![
                wrapper("yes", Arc::new(Always)),
                wrapper("no", Arc::new(Never)),
            ],
        };
        let filtered = filter_wrappers(&group, &ctx(None), Duration::from_millis(100)).await;
        assert_eq!(names(&filtered), vec!["yes"]);
    }

    #[tokio::test]
    async fn test_window_title_contains() {
        let group = WrapperGroup {
            wrappers: vec![
                wrapper("term", Arc::new(WindowTitleContains("Terminator".into()))),
                wrapper("vim", Arc::new(WindowTitleContains("VIM".into()))),
                wrapper("base", Arc::new(Always)),
            ],
        };
        let limit = Duration::from_millis(100);

        let filtered = filter_wrappers(&group, &ctx(Some("~/src - Terminator")), limit).await;
        assert_eq!(names(&filtered), vec!["term", "base"]);

        let filtered = filter_wrappers(&group, &ctx(None), limit).await;
        assert_eq!(names(&filtered), vec!["base"]);
    }

    #[tokio::test]
    async fn test_title_fetched_once_per_message() {
        let titles = Arc::new(CountingTitles(AtomicUsize::new(0)));
        let group = WrapperGroup {
            wrappers: vec![
                wrapper("a", Arc::new(WindowTitleContains("Terminator".into()))),
                wrapper("b", Arc::new(WindowTitleContains("src".into()))),
            ],
        };

        let message = MessageContext::new("", titles.clone());
        let filtered = filter_wrappers(&group, &message, Duration::from_millis(100)).await;
        assert_eq!(names(&filtered), vec!["a", "b"]);
        assert_eq!(titles.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_predicate_times_out() {
        let group = WrapperGroup {
            wrappers: vec![
                wrapper("slow", Arc::new(Stalls)),
                wrapper("fast", Arc::new(Always)),
            ],
        };
        let filtered = filter_wrappers(&group, &ctx(None), Duration::from_millis(500)).await;
        assert_eq!(names(&filtered), vec!["fast"]);
    }
}
