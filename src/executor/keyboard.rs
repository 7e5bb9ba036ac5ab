//! Real keyboard output using enigo
//!
//! Provides two methods for typing text into applications:
//! - **Direct**: enigo's native text input (default)
//! - **Clipboard**: copy text to the clipboard, then send Ctrl/Cmd+V
//!
//! enigo handles are not `Send` on every platform, so one dedicated thread
//! owns the input backend and actions reach it over a channel.

use std::thread;
use std::time::Duration;

use arboard::Clipboard;
use async_trait::async_trait;
use enigo::{Direction, Enigo, Keyboard, Settings};
use tracing::warn;

use super::{
    Action, ActionExecutor, ExecutorError, InputMethod, Key, KeyChord, Modifier, run_command,
    run_shell,
};

fn backend(e: impl std::fmt::Display) -> ExecutorError {
    ExecutorError::Input(e.to_string())
}

fn enigo_key(key: Key) -> enigo::Key {
    match key {
        Key::Char(c) => enigo::Key::Unicode(c),
        Key::Enter => enigo::Key::Return,
        Key::Tab => enigo::Key::Tab,
        Key::Space => enigo::Key::Space,
        Key::Backspace => enigo::Key::Backspace,
        Key::Delete => enigo::Key::Delete,
        Key::Escape => enigo::Key::Escape,
        Key::Up => enigo::Key::UpArrow,
        Key::Down => enigo::Key::DownArrow,
        Key::Left => enigo::Key::LeftArrow,
        Key::Right => enigo::Key::RightArrow,
        Key::Home => enigo::Key::Home,
        Key::End => enigo::Key::End,
        Key::PageUp => enigo::Key::PageUp,
        Key::PageDown => enigo::Key::PageDown,
        Key::Function(n) => function_key(n),
        Key::Modifier(m) => modifier_key(m),
    }
}

fn function_key(n: u8) -> enigo::Key {
    match n {
        1 => enigo::Key::F1,
        2 => enigo::Key::F2,
        3 => enigo::Key::F3,
        4 => enigo::Key::F4,
        5 => enigo::Key::F5,
        6 => enigo::Key::F6,
        7 => enigo::Key::F7,
        8 => enigo::Key::F8,
        9 => enigo::Key::F9,
        10 => enigo::Key::F10,
        11 => enigo::Key::F11,
        _ => enigo::Key::F12,
    }
}

fn modifier_key(m: Modifier) -> enigo::Key {
    match m {
        Modifier::Control => enigo::Key::Control,
        Modifier::Shift => enigo::Key::Shift,
        Modifier::Alt => enigo::Key::Alt,
        Modifier::Super => enigo::Key::Meta,
    }
}

/// The platform paste modifier (Cmd on macOS, Ctrl elsewhere)
fn paste_modifier() -> Modifier {
    if cfg!(target_os = "macos") {
        Modifier::Super
    } else {
        Modifier::Control
    }
}

/// Press a chord through `key`, releasing every modifier that went down
/// even when a later step fails.
fn press_chord<E>(
    chord: &KeyChord,
    mut key: impl FnMut(enigo::Key, Direction) -> Result<(), E>,
) -> Result<(), E> {
    let mut pressed = Vec::with_capacity(chord.modifiers.len());
    let mut result = Ok(());
    for m in &chord.modifiers {
        let modifier = modifier_key(*m);
        if let Err(e) = key(modifier, Direction::Press) {
            result = Err(e);
            break;
        }
        pressed.push(modifier);
    }

    if result.is_ok() {
        // Let the modifiers register before the key
        thread::sleep(Duration::from_millis(10));
        result = key(enigo_key(chord.key), Direction::Click);
        thread::sleep(Duration::from_millis(50));
    }

    for modifier in pressed.into_iter().rev() {
        let released = key(modifier, Direction::Release);
        if result.is_ok() {
            result = released;
        }
    }
    result
}

struct TypingInput {
    enigo: Enigo,
    clipboard: Clipboard,
    method: InputMethod,
}

impl TypingInput {
    fn new(method: InputMethod) -> Result<Self, ExecutorError> {
        Ok(Self {
            enigo: Enigo::new(&Settings::default()).map_err(backend)?,
            clipboard: Clipboard::new().map_err(backend)?,
            method,
        })
    }

    fn press(&mut self, chord: &KeyChord) -> Result<(), ExecutorError> {
        press_chord(chord, |key, direction| self.enigo.key(key, direction)).map_err(backend)
    }

    fn type_text(&mut self, text: &str) -> Result<(), ExecutorError> {
        if text.is_empty() {
            return Ok(());
        }
        match self.method {
            InputMethod::Direct => self.enigo.text(text).map_err(backend),
            InputMethod::Clipboard => match self.type_via_clipboard(text) {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(error = %e, "clipboard typing failed, typing directly");
                    self.enigo.text(text).map_err(backend)
                }
            },
        }
    }

    fn type_via_clipboard(&mut self, text: &str) -> Result<(), ExecutorError> {
        let previous = self.clipboard.get_text().ok();
        self.clipboard.set_text(text).map_err(backend)?;
        thread::sleep(Duration::from_millis(50));

        let pasted = self.press(&KeyChord::key(Key::Char('v')).with_modifier(paste_modifier()));
        thread::sleep(Duration::from_millis(100));

        if let Some(previous) = previous {
            let _ = self.clipboard.set_text(previous);
        }
        pasted
    }
}

enum Request {
    Press(KeyChord),
    Type(String),
}

type Job = (Request, flume::Sender<Result<(), ExecutorError>>);

/// Presses keys and types text on the local desktop
pub struct KeyboardExecutor {
    jobs: flume::Sender<Job>,
}

impl KeyboardExecutor {
    pub async fn new(method: InputMethod) -> Result<Self, ExecutorError> {
        let (jobs, receiver) = flume::unbounded::<Job>();
        let (ready_tx, ready_rx) = flume::bounded(1);

        thread::Builder::new()
            .name("voca-keyboard".to_string())
            .spawn(move || {
                let mut input = match TypingInput::new(method) {
                    Ok(input) => {
                        let _ = ready_tx.send(Ok(()));
                        input
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                for (request, reply) in receiver.iter() {
                    let result = match request {
                        Request::Press(chord) => input.press(&chord),
                        Request::Type(text) => input.type_text(&text),
                    };
                    let _ = reply.send(result);
                }
            })
            .map_err(|source| ExecutorError::Spawn {
                program: "keyboard thread".to_string(),
                source,
            })?;

        ready_rx
            .recv_async()
            .await
            .map_err(|_| ExecutorError::Input("keyboard thread exited".to_string()))??;
        Ok(Self { jobs })
    }

    async fn send(&self, request: Request) -> Result<(), ExecutorError> {
        let (reply, response) = flume::bounded(1);
        self.jobs
            .send_async((request, reply))
            .await
            .map_err(|_| ExecutorError::Input("keyboard thread exited".to_string()))?;
        response
            .recv_async()
            .await
            .map_err(|_| ExecutorError::Input("keyboard thread exited".to_string()))?
    }
}

#[async_trait]
impl ActionExecutor for KeyboardExecutor {
    async fn execute(&self, action: Action) -> Result<(), ExecutorError> {
        match action {
            Action::Press(chord) => self.send(Request::Press(chord)).await,
            Action::TypeText(text) => self.send(Request::Type(text)).await,
            Action::Shell(command) => run_shell(&command).await,
            Action::Alert(text) => run_command(&["notify-send", "voca", &text]).await,
            Action::Speak(text) => {
                let program = if cfg!(target_os = "macos") { "say" } else { "espeak" };
                run_command(&[program, &text]).await
            }
        }
    }
}
