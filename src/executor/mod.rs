//! Side effects of matched commands
//!
//! Handlers never touch the desktop directly; they hand an [`Action`] to an
//! [`ActionExecutor`]. The log executor records each action as a structured
//! log line, the keyboard executor (feature `typing`) performs it.

pub mod keys;

#[cfg(feature = "typing")]
pub mod keyboard;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

pub use keys::{Key, KeyChord, KeyError, Modifier};

/// Errors raised while performing an action
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    CommandFailed { command: String, status: std::process::ExitStatus },

    #[error("input backend: {0}")]
    Input(String),
}

/// How the keyboard executor enters text
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMethod {
    /// enigo's native text input
    #[default]
    Direct,
    /// Copy to the clipboard, then paste
    Clipboard,
}

/// One desktop side effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Press(KeyChord),
    TypeText(String),
    Shell(String),
    Alert(String),
    Speak(String),
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Press(_) => "press",
            Action::TypeText(_) => "type_text",
            Action::Shell(_) => "shell",
            Action::Alert(_) => "alert",
            Action::Speak(_) => "speak",
        }
    }

    pub fn value(&self) -> String {
        match self {
            Action::Press(chord) => chord.to_string(),
            Action::TypeText(text)
            | Action::Shell(text)
            | Action::Alert(text)
            | Action::Speak(text) => text.clone(),
        }
    }
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: Action) -> Result<(), ExecutorError>;
}

/// Logs every action instead of performing it
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExecutor;

#[async_trait]
impl ActionExecutor for LogExecutor {
    async fn execute(&self, action: Action) -> Result<(), ExecutorError> {
        info!(action = action.kind(), value = %action.value(), "action");
        Ok(())
    }
}

/// Keeps every action in memory
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    actions: Mutex<Vec<Action>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions
            .lock()
            .map(|actions| actions.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, action: Action) -> Result<(), ExecutorError> {
        if let Ok(mut actions) = self.actions.lock() {
            actions.push(action);
        }
        Ok(())
    }
}

/// Which executor a worker drives
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Log,
    Keyboard,
}

/// Create the executor a worker hands its actions to.
pub async fn build_executor(
    kind: ExecutorKind,
    method: InputMethod,
) -> Result<Arc<dyn ActionExecutor>, ExecutorError> {
    match kind {
        ExecutorKind::Log => Ok(Arc::new(LogExecutor)),
        #[cfg(feature = "typing")]
        ExecutorKind::Keyboard => Ok(Arc::new(keyboard::KeyboardExecutor::new(method).await?)),
        #[cfg(not(feature = "typing"))]
        ExecutorKind::Keyboard => {
            tracing::warn!(?method, "built without the `typing` feature, logging actions instead");
            Ok(Arc::new(LogExecutor))
        }
    }
}

/// Run `argv` to completion, failing on a non-zero exit status.
pub async fn run_command(argv: &[&str]) -> Result<(), ExecutorError> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let status = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|source| ExecutorError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if status.success() {
        Ok(())
    } else {
        Err(ExecutorError::CommandFailed {
            command: argv.join(" "),
            status,
        })
    }
}

/// Run a command line through `sh -c`.
pub async fn run_shell(command: &str) -> Result<(), ExecutorError> {
    run_command(&["sh", "-c", command]).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_and_value() {
        let press = Action::Press("control+s".parse().unwrap());
        assert_eq!(press.kind(), "press");
        assert_eq!(press.value(), "control+s");
        assert_eq!(Action::TypeText("def".into()).kind(), "type_text");
        assert_eq!(Action::Speak("14".into()).value(), "14");
    }

    #[tokio::test]
    async fn test_recording_executor_keeps_order() {
        let recorder = RecordingExecutor::new();
        recorder.execute(Action::TypeText("a".into())).await.unwrap();
        recorder.execute(Action::Alert("b".into())).await.unwrap();
        assert_eq!(
            recorder.actions(),
            vec![Action::TypeText("a".into()), Action::Alert("b".into())]
        );
    }

    #[tokio::test]
    async fn test_log_executor_is_default() {
        assert_eq!(ExecutorKind::default(), ExecutorKind::Log);
        assert!(build_executor(ExecutorKind::Log, InputMethod::Direct).await.is_ok());
    }

    #[tokio::test]
    async fn test_run_shell_reports_failure() {
        run_shell("true").await.unwrap();
        assert!(matches!(
            run_shell("exit 7").await,
            Err(ExecutorError::CommandFailed { .. })
        ));
        assert!(matches!(
            run_command(&["voca-no-such-program"]).await,
            Err(ExecutorError::Spawn { .. })
        ));
    }
}
