//! Worker process: parse transcripts and run the matched handlers
//!
//! A worker reads manager envelopes from stdin, one per line. For each one it
//! filters the loaded plugins by context, builds (or reuses) a dispatcher for
//! the active set, parses the transcript and runs every matched command in
//! spoken order.
//!
//! ```text
//! Idle -> ParsingMessage -> Dispatching -> Idle
//!                               |
//!                               +-> Faulted -> Idle   (handler error, logged;
//!                                                      later commands still run)
//! ```
//!
//! After each message the worker prints `{"job_finished": "<correlation id>"}`
//! so a manager reusing workers knows the slot is free. A handler returning
//! [`Reload`] ends the worker with the matching exit code.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::{MessageContext, WindowTitleSource, filter_wrappers};
use crate::envelope::{Envelope, EnvelopeError, Incoming};
use crate::frame::{FrameError, FrameReader};
use crate::grammar::{Dispatcher, GrammarError, Reload};
use crate::plugin::WrapperGroup;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("cannot write to the manager: {0}")]
    Output(#[from] std::io::Error),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    ParsingMessage,
    Dispatching,
    Faulted,
}

/// Completion marker a worker prints after each message
#[derive(Debug, Serialize, Deserialize)]
struct JobFinished {
    job_finished: String,
}

pub fn job_finished_line(correlation_id: &str) -> Result<Vec<u8>, EnvelopeError> {
    let mut line = serde_json::to_vec(&JobFinished {
        job_finished: correlation_id.to_string(),
    })?;
    line.push(b'\n');
    Ok(line)
}

/// The correlation id of a completion marker line, if `line` is one.
pub fn parse_job_finished(line: &[u8]) -> Option<String> {
    if !line.starts_with(b"{\"job_finished\"") {
        return None;
    }
    serde_json::from_slice::<JobFinished>(line)
        .ok()
        .map(|marker| marker.job_finished)
}

pub struct Worker {
    wrappers: WrapperGroup,
    titles: Arc<dyn WindowTitleSource>,
    context_timeout: Duration,
    /// Dispatcher for the most recent active plugin set
    cache: Option<(Vec<String>, Arc<Dispatcher>)>,
    state: WorkerState,
}

impl Worker {
    pub fn new(
        wrappers: WrapperGroup,
        titles: Arc<dyn WindowTitleSource>,
        context_timeout: Duration,
    ) -> Self {
        Self {
            wrappers,
            titles,
            context_timeout,
            cache: None,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Dispatcher for the plugins active in `ctx`, rebuilt when the set changes.
    async fn dispatcher(&mut self, ctx: &MessageContext) -> Result<Arc<Dispatcher>, GrammarError> {
        let active = filter_wrappers(&self.wrappers, ctx, self.context_timeout).await;
        let names: Vec<String> = active.names().into_iter().map(str::to_string).collect();

        if let Some((cached, dispatcher)) = &self.cache
            && *cached == names
        {
            return Ok(dispatcher.clone());
        }

        let dispatcher = Arc::new(Dispatcher::from_registry(&active.registry())?);
        for diagnostic in dispatcher.diagnostics() {
            warn!(error = %diagnostic, "pattern skipped");
        }
        debug!(plugins = ?names, "grammar compiled");
        self.cache = Some((names, dispatcher.clone()));
        Ok(dispatcher)
    }

    /// Handle one envelope. Returns a reload request if a handler made one.
    pub async fn handle_message(&mut self, envelope: &Envelope) -> Option<Reload> {
        let span = info_span!(
            "handle_message",
            correlation_id = envelope.correlation_id.as_deref().unwrap_or("")
        );
        let reload = self.handle(envelope).instrument(span.clone()).await;
        span.in_scope(|| debug!(state = ?self.state, "message handled"));
        self.state = WorkerState::Idle;
        reload
    }

    async fn handle(&mut self, envelope: &Envelope) -> Option<Reload> {
        self.state = WorkerState::ParsingMessage;
        let ctx = MessageContext::new(&envelope.transcript, self.titles.clone());

        let dispatcher = match self.dispatcher(&ctx).await {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                error!(error = %e, "grammar failed to compile");
                return None;
            }
        };
        let commands = match dispatcher.parse(&envelope.transcript) {
            Ok(commands) => commands,
            Err(e) => {
                warn!(error = %e, transcript = %envelope.transcript, "transcript did not parse");
                return None;
            }
        };

        self.state = WorkerState::Dispatching;
        for command in commands {
            let Some(handler) = dispatcher.handler(&command.rule) else {
                continue;
            };
            let span = info_span!(
                "run_command",
                command = %command.pattern,
                args = ?command.args
            );
            let result = async {
                info!("running command");
                handler.call(command.args.clone()).await
            }
            .instrument(span)
            .await;

            if let Err(e) = result {
                if let Some(reload) = e.downcast_ref::<Reload>() {
                    info!(command = %command.pattern, %reload, "reload requested");
                    return Some(*reload);
                }
                self.state = WorkerState::Faulted;
                error!(
                    command = %command.pattern,
                    args = ?command.args,
                    error = %format!("{e:#}"),
                    "command failed"
                );
            }
        }
        None
    }

    /// Serve envelopes from `input` until it closes.
    ///
    /// Returns the process exit code: `0` at end of input (or after the first
    /// message with `once`), or a reload code.
    pub async fn run<R, W>(&mut self, input: R, mut output: W, once: bool) -> Result<i32, WorkerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let frames = FrameReader::lines(input).into_stream();
        futures_util::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let envelope = match Envelope::decode(&frame) {
                Ok(Incoming::Transcript(envelope)) => envelope,
                Ok(Incoming::OutOfBand) => {
                    debug!("ignoring out-of-band line");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed message");
                    continue;
                }
            };

            if let Some(reload) = self.handle_message(&envelope).await {
                return Ok(reload.exit_code());
            }
            if let Some(id) = &envelope.correlation_id {
                output.write_all(&job_finished_line(id)?).await?;
                output.flush().await?;
            }
            if once {
                break;
            }
        }
        Ok(0)
    }
}
