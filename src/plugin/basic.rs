//! Key chords, typing and alerts, plus the small context samples built on them

use std::sync::Arc;

use anyhow::{Context as _, bail};

use super::{Wrapper, action_handler, joined};
use crate::context::{Never, WindowTitleContains};
use crate::executor::{Action, ActionExecutor, Key, KeyChord, Modifier, keys};
use crate::grammar::{Arg, Handler, Registry};

/// Define `key`, `chord` and `any_text`.
pub(super) fn define_fragments(registry: &mut Registry) {
    let names: Vec<String> = keys::spoken_names().map(|n| format!("\"{n}\"")).collect();
    registry.define([
        ("key", format!("({})", names.join(" | "))),
        ("chord", "<key> (plus <key>)*".to_string()),
        ("any_text", r"/\w.+/".to_string()),
    ]);
}

fn chord_arg(args: &[Arg]) -> anyhow::Result<KeyChord> {
    let spoken = joined(args);
    KeyChord::from_spoken(&spoken).with_context(|| format!("not a chord: {spoken:?}"))
}

fn press(executor: &Arc<dyn ActionExecutor>) -> Handler {
    action_handler("press", executor, |args| Ok(Action::Press(chord_arg(&args)?)))
}

fn write(executor: &Arc<dyn ActionExecutor>, name: &str, text: &'static str) -> Handler {
    action_handler(name, executor, move |_args| Ok(Action::TypeText(text.to_string())))
}

fn alert(executor: &Arc<dyn ActionExecutor>) -> Handler {
    action_handler("alert", executor, |args| Ok(Action::Alert(joined(&args))))
}

pub(super) fn basic(executor: &Arc<dyn ActionExecutor>) -> Wrapper {
    let mut registry = Registry::new();
    define_fragments(&mut registry);

    let say = registry.register("say <chord>", press(executor));
    registry.register("<chord>", say);
    registry.register(
        "switch <chord>",
        action_handler("switch", executor, |args| {
            Ok(Action::Press(chord_arg(&args)?.with_modifier(Modifier::Super)))
        }),
    );
    registry.register("alert <any_text>", alert(executor));
    registry.register(
        "type <any_text>",
        action_handler("type", executor, |args| Ok(Action::TypeText(joined(&args)))),
    );
    for (pattern, c) in [("monitor", 'M'), ("mouse", 'O')] {
        registry.register(
            pattern,
            action_handler(pattern, executor, move |_args| {
                Ok(Action::Press(KeyChord::key(Key::Char(c))))
            }),
        );
    }
    registry.register(
        "div zero",
        Handler::new("div_zero", |_args| async { bail!("division by zero") }),
    );

    Wrapper::always("basic", registry)
}

pub(super) fn yes(executor: &Arc<dyn ActionExecutor>) -> Wrapper {
    let mut registry = Registry::new();
    define_fragments(&mut registry);
    registry.register("hit <chord>", write(executor, "hit", "def"));
    Wrapper::always("yes", registry)
}

pub(super) fn no(executor: &Arc<dyn ActionExecutor>) -> Wrapper {
    let mut registry = Registry::new();
    registry.register("nope", write(executor, "nope", "xyz"));
    Wrapper::new("no", registry, Arc::new(Never))
}

pub(super) fn terminal(executor: &Arc<dyn ActionExecutor>) -> Wrapper {
    let mut registry = Registry::new();
    define_fragments(&mut registry);
    registry.register("declare <any_text>", alert(executor));
    Wrapper::new(
        "terminal",
        registry,
        Arc::new(WindowTitleContains("terminator".into())),
    )
}

pub(super) fn turtle(executor: &Arc<dyn ActionExecutor>) -> Wrapper {
    let mut registry = Registry::new();
    registry.register("check", write(executor, "check", "turt"));
    Wrapper::new(
        "turtle",
        registry,
        Arc::new(WindowTitleContains("Python Turtle Graphics".into())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use crate::grammar::Dispatcher;

    async fn run(wrapper: &Wrapper, transcript: &str) -> anyhow::Result<()> {
        let dispatcher = Dispatcher::from_registry(&wrapper.registry)?;
        for command in dispatcher.parse(transcript)? {
            dispatcher
                .handler(&command.rule)
                .context("rule without handler")?
                .call(command.args)
                .await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_basic_commands() {
        let recorder = RecordingExecutor::new();
        let executor: Arc<dyn ActionExecutor> = recorder.clone();
        let wrapper = basic(&executor);

        run(&wrapper, "say alpha").await.unwrap();
        run(&wrapper, "control plus shift plus tango").await.unwrap();
        run(&wrapper, "switch three").await.unwrap();
        run(&wrapper, "type hello world").await.unwrap();
        run(&wrapper, "alert build finished").await.unwrap();
        run(&wrapper, "monitor").await.unwrap();

        assert_eq!(
            recorder.actions(),
            vec![
                Action::Press("a".parse().unwrap()),
                Action::Press("control+shift+t".parse().unwrap()),
                Action::Press("super+3".parse().unwrap()),
                Action::TypeText("hello world".into()),
                Action::Alert("build finished".into()),
                Action::Press(KeyChord::key(Key::Char('M'))),
            ]
        );
    }

    #[tokio::test]
    async fn test_div_zero_fails() {
        let wrapper = basic(&(Arc::new(crate::executor::LogExecutor) as Arc<dyn ActionExecutor>));
        let err = run(&wrapper, "div zero").await.unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_sample_contexts() {
        let executor: Arc<dyn ActionExecutor> = RecordingExecutor::new();
        assert_eq!(format!("{:?}", no(&executor).context), "Never");
        assert_eq!(
            format!("{:?}", terminal(&executor).context),
            "WindowTitleContains(\"terminator\")"
        );
    }
}
