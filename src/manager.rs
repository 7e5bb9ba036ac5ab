//! Manager: admit transcripts and hand them to the worker pool
//!
//! The manager reads recognizer lines from its input in arrival order. For
//! each line [`ModeState::route`] decides, in that same order, whether it is
//! relayed (out-of-band), consumed (the `mode` toggle), dropped (wrong
//! finality for the current mode) or dispatched. Dispatched envelopes go into
//! a FIFO queue served by one task per pool slot, so jobs may finish out of
//! order but each worker runs one job at a time.
//!
//! When the input closes (or on Ctrl-C) the queue is closed and in-flight
//! jobs get `shutdown_grace_ms` to finish; after that the slot tasks are
//! aborted and their worker processes killed.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::envelope::{Envelope, EnvelopeError, Incoming, Modes};
use crate::frame::{FrameError, FrameReader};
use crate::pool::{Pool, PoolError};

/// Leading word that toggles strict/eager mode
pub const MODE_COMMAND: &str = "mode";

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("cannot write output: {0}")]
    Output(#[from] std::io::Error),
}

/// What to do with one upstream line
#[derive(Debug)]
pub enum Route {
    /// Not a recognizer result; relay unchanged
    Passthrough,
    /// The mode toggle
    Consumed,
    /// Wrong finality for the current mode
    Dropped,
    /// Send to a worker
    Dispatch(Envelope),
}

/// Strict mode dispatches final transcripts; eager mode dispatches partial ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeState {
    pub strict: bool,
}

impl Default for ModeState {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl ModeState {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Decide what happens to one upstream line, toggling mode if asked.
    pub fn route(&mut self, frame: &[u8]) -> Route {
        let envelope = match Envelope::decode(frame) {
            Ok(Incoming::Transcript(envelope)) => envelope,
            Ok(Incoming::OutOfBand) => return Route::Passthrough,
            Err(EnvelopeError::MissingTranscript) => {
                warn!("recognizer result without a transcript");
                return Route::Dropped;
            }
            Err(e) => {
                debug!(error = %e, "relaying undecodable line");
                return Route::Passthrough;
            }
        };

        if envelope.leading_word() == MODE_COMMAND {
            self.strict = !self.strict;
            info!(strict = self.strict, "mode toggled");
            return Route::Consumed;
        }

        if envelope.is_final != self.strict {
            debug!(
                transcript = %envelope.transcript,
                is_final = envelope.is_final,
                strict = self.strict,
                "not admitted in this mode"
            );
            return Route::Dropped;
        }

        Route::Dispatch(envelope.tagged(Modes {
            strict: self.strict,
        }))
    }
}

/// Write relayed lines to `sink` until every sender is gone.
pub async fn write_output<W>(lines: flume::Receiver<Vec<u8>>, mut sink: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(line) = lines.recv_async().await {
        sink.write_all(&line).await?;
        sink.flush().await?;
    }
    Ok(())
}

/// One pool slot: take queued envelopes and run them until the queue closes.
async fn serve_slot(pool: Arc<Pool>, queue: flume::Receiver<Envelope>) -> Result<(), PoolError> {
    while let Ok(envelope) = queue.recv_async().await {
        let id = envelope.correlation_id.clone().unwrap_or_default();
        let line = match envelope.encode() {
            Ok(line) => line,
            Err(e) => {
                error!(correlation_id = %id, error = %e, "cannot encode envelope");
                continue;
            }
        };

        let mut lease = pool.acquire().await?;
        debug!(correlation_id = %id, worker = lease.worker.id, transcript = %envelope.transcript, "dispatching");
        let end = lease.worker.run_job(&line, &id, pool.policy()).await;
        pool.release_and_replace(lease, end).await?;
    }
    Ok(())
}

pub struct Manager {
    pool: Arc<Pool>,
    mode: ModeState,
    slots: usize,
    grace: Duration,
}

impl Manager {
    pub fn new(pool: Pool, slots: usize, mode: ModeState, grace: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            mode,
            slots: slots.max(1),
            grace,
        }
    }

    pub fn mode(&self) -> ModeState {
        self.mode
    }

    /// Run until `input` closes or `interrupt` fires.
    ///
    /// Relayed and passed-through lines go to `output`. Returns an error only
    /// for failures that stop the whole manager: unreadable input or a worker
    /// that cannot be spawned.
    pub async fn run<R>(
        &mut self,
        input: R,
        output: flume::Sender<Vec<u8>>,
        interrupt: flume::Receiver<()>,
    ) -> Result<(), ManagerError>
    where
        R: AsyncRead + Unpin,
    {
        let (queue, jobs) = flume::unbounded::<Envelope>();
        let mut slots = JoinSet::new();
        for _ in 0..self.slots {
            slots.spawn(serve_slot(self.pool.clone(), jobs.clone()));
        }

        let mut frames = FrameReader::lines(input);
        let result = loop {
            tokio::select! {
                frame = frames.next_frame() => match frame {
                    Ok(Some(frame)) => match self.mode.route(&frame) {
                        Route::Passthrough => {
                            let mut line = frame;
                            line.push(b'\n');
                            let _ = output.send_async(line).await;
                        }
                        Route::Dispatch(envelope) => {
                            if let Err(flume::SendError(envelope)) = queue.send(envelope) {
                                error!(
                                    correlation_id = envelope.correlation_id.as_deref().unwrap_or(""),
                                    transcript = %envelope.transcript,
                                    "no worker slot is running, dropping transcript"
                                );
                            }
                        }
                        Route::Consumed | Route::Dropped => {}
                    },
                    Ok(None) => {
                        info!("input closed");
                        break Ok(());
                    }
                    Err(e) => break Err(ManagerError::from(e)),
                },
                Ok(()) = interrupt.recv_async() => {
                    info!("interrupted");
                    break Ok(());
                }
                Some(joined) = slots.join_next() => {
                    if let Err(e) = self.slot_ended(&mut slots, &jobs, joined) {
                        break Err(e);
                    }
                }
            }
        };

        drop(queue);
        drop(jobs);
        let drained = self.drain(&mut slots).await;
        self.pool.shutdown().await;
        result.and(drained)
    }

    /// A slot task ended while input is still open: fail, or start a new slot.
    fn slot_ended(
        &self,
        slots: &mut JoinSet<Result<(), PoolError>>,
        jobs: &flume::Receiver<Envelope>,
        joined: Result<Result<(), PoolError>, tokio::task::JoinError>,
    ) -> Result<(), ManagerError> {
        if let Some(e) = slot_failure(joined) {
            return Err(e);
        }
        warn!(running = slots.len(), "restarting worker slot");
        slots.spawn(serve_slot(self.pool.clone(), jobs.clone()));
        Ok(())
    }

    /// Wait for queued and in-flight jobs, up to the grace period.
    async fn drain(&self, slots: &mut JoinSet<Result<(), PoolError>>) -> Result<(), ManagerError> {
        let mut failure = None;
        let waited = tokio::time::timeout(self.grace, async {
            while let Some(joined) = slots.join_next().await {
                if let Some(e) = slot_failure(joined) {
                    failure.get_or_insert(e);
                }
            }
        })
        .await;

        if waited.is_err() {
            warn!(
                grace_ms = self.grace.as_millis() as u64,
                remaining = slots.len(),
                "shutdown grace period over, killing workers"
            );
            slots.shutdown().await;
        }
        failure.map_or(Ok(()), Err)
    }
}

fn slot_failure(
    joined: Result<Result<(), PoolError>, tokio::task::JoinError>,
) -> Option<ManagerError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            error!(error = %e, "worker slot failed");
            Some(e.into())
        }
        Err(e) if e.is_cancelled() => None,
        Err(e) => {
            error!(error = %e, "worker slot panicked");
            None
        }
    }
}
