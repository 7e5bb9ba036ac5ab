//! Plugins declared in the config file
//!
//! Each command maps a pattern to an action string:
//!
//! | action            | effect                         |
//! |-------------------|--------------------------------|
//! | `key:control+s`   | press a written chord          |
//! | `type:some text`  | type text                      |
//! | `shell:ls -la`    | run through `sh -c`            |
//! | `alert:done`      | desktop notification           |
//!
//! `{}` in the action value is replaced by the command's captured arguments.

use std::sync::Arc;

use super::{PluginError, Wrapper, action_handler, joined};
use crate::config::PluginConfig;
use crate::context::{Always, ContextPredicate, WindowTitleContains};
use crate::executor::{Action, ActionExecutor, KeyChord};
use crate::grammar::{Handler, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionKind {
    Key,
    Type,
    Shell,
    Alert,
}

fn parse_action(action: &str) -> Option<(ActionKind, String)> {
    let (kind, value) = action.split_once(':')?;
    let kind = match kind.trim() {
        "key" => ActionKind::Key,
        "type" => ActionKind::Type,
        "shell" => ActionKind::Shell,
        "alert" => ActionKind::Alert,
        _ => return None,
    };
    Some((kind, value.to_string()))
}

fn handler(
    name: &str,
    kind: ActionKind,
    template: String,
    executor: &Arc<dyn ActionExecutor>,
) -> Handler {
    action_handler(name, executor, move |args| {
        let value = template.replace("{}", &joined(&args));
        Ok(match kind {
            ActionKind::Key => Action::Press(value.parse::<KeyChord>()?),
            ActionKind::Type => Action::TypeText(value),
            ActionKind::Shell => Action::Shell(value),
            ActionKind::Alert => Action::Alert(value),
        })
    })
}

/// Build a wrapper from a `[[plugins]]` table.
pub(super) fn from_config(
    config: &PluginConfig,
    executor: &Arc<dyn ActionExecutor>,
) -> Result<Wrapper, PluginError> {
    let mut registry = Registry::new();
    registry.define(config.define.iter().map(|(k, v)| (k.clone(), v.clone())));

    for (pattern, action) in &config.commands {
        let (kind, template) = parse_action(action).ok_or_else(|| PluginError::Action {
            plugin: config.name.clone(),
            pattern: pattern.clone(),
            action: action.clone(),
        })?;
        registry.register(pattern, handler(pattern, kind, template, executor));
    }

    let context: Arc<dyn ContextPredicate> = match &config.window_title {
        Some(title) => Arc::new(WindowTitleContains(title.clone())),
        None => Arc::new(Always),
    };
    Ok(Wrapper::new(&config.name, registry, context))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;
    use crate::grammar::Dispatcher;

    fn editor(commands: &[(&str, &str)]) -> PluginConfig {
        PluginConfig {
            name: "editor".into(),
            window_title: Some("vim".into()),
            define: [("direction".to_string(), "(up|down)".to_string())].into(),
            commands: commands
                .iter()
                .map(|(p, a)| (p.to_string(), a.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(
            parse_action("key:control+s"),
            Some((ActionKind::Key, "control+s".into()))
        );
        assert_eq!(
            parse_action("shell:echo a:b"),
            Some((ActionKind::Shell, "echo a:b".into()))
        );
        assert_eq!(parse_action("launch:rockets"), None);
        assert_eq!(parse_action("no separator"), None);
    }

    #[test]
    fn test_unknown_action_rejects_plugin() {
        let executor: Arc<dyn ActionExecutor> = RecordingExecutor::new();
        let err = from_config(&editor(&[("boom", "launch:rockets")]), &executor).unwrap_err();
        assert!(matches!(err, PluginError::Action { ref pattern, .. } if pattern == "boom"));
    }

    #[tokio::test]
    async fn test_declared_commands_run() {
        let recorder = RecordingExecutor::new();
        let executor: Arc<dyn ActionExecutor> = recorder.clone();
        let wrapper = from_config(
            &editor(&[
                ("save file", "key:control+s"),
                ("go <direction>", "type:moved {}"),
            ]),
            &executor,
        )
        .unwrap();
        assert_eq!(format!("{:?}", wrapper.context), "WindowTitleContains(\"vim\")");

        let dispatcher = Dispatcher::from_registry(&wrapper.registry).unwrap();
        for command in dispatcher.parse("save file go down").unwrap() {
            dispatcher
                .handler(&command.rule)
                .unwrap()
                .call(command.args)
                .await
                .unwrap();
        }
        assert_eq!(
            recorder.actions(),
            vec![
                Action::Press("control+s".parse().unwrap()),
                Action::TypeText("moved down".into()),
            ]
        );
    }
}
