//! Pool of worker subprocesses
//!
//! Each pool slot owns one live `voca worker` process. A dispatch takes a
//! worker with [`Pool::acquire`], writes one envelope to its stdin and waits
//! for the job to end, then gives the slot back with
//! [`Pool::release_and_replace`]:
//!
//! - `replace` policy: the worker runs with `--once` and exits after its job;
//!   a fresh process is spawned before the slot's capacity is returned.
//! - `reuse` policy: the worker prints a completion marker and goes back to
//!   the idle set. It is replaced only if it exited.
//!
//! Exit codes 3 and 4 switch the plugin set future workers start with.
//! Everything a worker prints, other than completion markers, is relayed to
//! the manager's output channel.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PoolPolicy;
use crate::frame::FrameReader;
use crate::grammar::Reload;
use crate::worker::parse_job_finished;

/// How long to wait for a finished worker's remaining output
const RELAY_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("cannot spawn worker {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker pool is closed")]
    Closed,
}

/// Which plugins a worker starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginSet {
    Default,
    Safe,
}

/// Everything needed to start a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    /// Flags placed before the `worker` subcommand (`--config`, `--no-log`)
    pub global_args: Vec<String>,
    /// Flags placed after it (`--executor`)
    pub worker_args: Vec<String>,
    pub plugins: Vec<String>,
    pub safe_plugins: Vec<String>,
    pub policy: PoolPolicy,
}

impl WorkerCommand {
    pub fn args(&self, set: PluginSet) -> Vec<String> {
        let mut args = self.global_args.clone();
        args.push("worker".to_string());
        args.extend(self.worker_args.iter().cloned());
        let plugins = match set {
            PluginSet::Default => &self.plugins,
            PluginSet::Safe => &self.safe_plugins,
        };
        for plugin in plugins {
            args.push("-i".to_string());
            args.push(plugin.clone());
        }
        if self.policy == PoolPolicy::Replace {
            args.push("--once".to_string());
        }
        args
    }
}

/// How a job ended
#[derive(Debug)]
pub enum JobEnd {
    /// The worker reported completion and is still running
    Finished,
    /// The worker process exited
    Exited(ExitStatus),
    /// The worker could not be reached or waited on
    Lost(std::io::Error),
}

/// One live worker process
pub struct WorkerProcess {
    pub id: u64,
    set: PluginSet,
    child: Child,
    stdin: Option<ChildStdin>,
    finished: flume::Receiver<String>,
    relay: JoinHandle<()>,
}

impl WorkerProcess {
    fn spawn(
        id: u64,
        command: &WorkerCommand,
        set: PluginSet,
        output: flume::Sender<Vec<u8>>,
    ) -> Result<Self, PoolError> {
        let mut child = Command::new(&command.program)
            .args(command.args(set))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PoolError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let (finished_tx, finished) = flume::unbounded();

        let relay = tokio::spawn(async move {
            let Some(stdout) = stdout else {
                return;
            };
            let mut frames = FrameReader::lines(stdout);
            loop {
                match frames.next_frame().await {
                    Ok(Some(frame)) => {
                        if let Some(id) = parse_job_finished(&frame) {
                            let _ = finished_tx.send(id);
                            continue;
                        }
                        let mut line = frame;
                        line.push(b'\n');
                        if output.send_async(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(worker = id, error = %e, "worker output failed");
                        break;
                    }
                }
            }
        });

        debug!(worker = id, ?set, pid = ?child.id(), "worker spawned");
        Ok(Self {
            id,
            set,
            child,
            stdin,
            finished,
            relay,
        })
    }

    /// Write one encoded envelope and wait for the job to end.
    pub async fn run_job(&mut self, line: &[u8], correlation_id: &str, policy: PoolPolicy) -> JobEnd {
        if let Err(e) = self.send(line).await {
            // Usually the worker died before its job; report how it ended.
            let _ = self.child.start_kill();
            return match self.child.wait().await {
                Ok(status) => JobEnd::Exited(status),
                Err(_) => JobEnd::Lost(e),
            };
        }
        if policy == PoolPolicy::Replace {
            return self.wait_exit().await;
        }

        let worker = self.id;
        let finished = self.finished.clone();
        loop {
            tokio::select! {
                id = finished.recv_async() => match id {
                    Ok(id) if id == correlation_id => return JobEnd::Finished,
                    Ok(id) => debug!(worker, stale = %id, "ignoring stale completion"),
                    Err(_) => break,
                },
                status = self.child.wait() => {
                    return match status {
                        Ok(status) => JobEnd::Exited(status),
                        Err(e) => JobEnd::Lost(e),
                    };
                }
            }
        }
        self.wait_exit().await
    }

    async fn send(&mut self, line: &[u8]) -> std::io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(line).await?;
        stdin.flush().await
    }

    async fn wait_exit(&mut self) -> JobEnd {
        match self.child.wait().await {
            Ok(status) => JobEnd::Exited(status),
            Err(e) => JobEnd::Lost(e),
        }
    }

    /// Close stdin, give the relay a moment to drain, then kill the process.
    async fn retire(mut self) {
        self.stdin = None;
        if tokio::time::timeout(RELAY_DRAIN, &mut self.relay).await.is_err() {
            self.relay.abort();
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// A worker checked out of the pool, plus its capacity permit
pub struct Lease {
    pub worker: WorkerProcess,
    _permit: OwnedSemaphorePermit,
}

pub struct Pool {
    command: WorkerCommand,
    output: flume::Sender<Vec<u8>>,
    idle: Mutex<Vec<WorkerProcess>>,
    permits: Arc<Semaphore>,
    set: Mutex<PluginSet>,
    next_id: Mutex<u64>,
}

impl Pool {
    /// Start `size` workers. Fails if any of them cannot be spawned.
    pub fn start(
        command: WorkerCommand,
        size: usize,
        output: flume::Sender<Vec<u8>>,
    ) -> Result<Self, PoolError> {
        let size = size.max(1);
        let pool = Self {
            command,
            output,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            set: Mutex::new(PluginSet::Default),
            next_id: Mutex::new(0),
        };
        for _ in 0..size {
            let worker = pool.spawn(PluginSet::Default)?;
            pool.push_idle(worker);
        }
        info!(size, policy = ?pool.command.policy, "worker pool started");
        Ok(pool)
    }

    pub fn policy(&self) -> PoolPolicy {
        self.command.policy
    }

    fn current_set(&self) -> PluginSet {
        self.set.lock().map(|set| *set).unwrap_or(PluginSet::Default)
    }

    fn spawn(&self, set: PluginSet) -> Result<WorkerProcess, PoolError> {
        let id = match self.next_id.lock() {
            Ok(mut next) => {
                *next += 1;
                *next
            }
            Err(_) => 0,
        };
        WorkerProcess::spawn(id, &self.command, set, self.output.clone())
    }

    fn push_idle(&self, worker: WorkerProcess) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(worker);
        }
    }

    fn pop_idle(&self) -> Option<WorkerProcess> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    /// Wait for a free slot and check its worker out.
    ///
    /// Waiters are served in FIFO order. A worker started with an outdated
    /// plugin set is replaced first.
    pub async fn acquire(&self) -> Result<Lease, PoolError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        let set = self.current_set();
        let worker = match self.pop_idle() {
            Some(worker) if worker.set == set => worker,
            Some(stale) => {
                debug!(worker = stale.id, "replacing worker with outdated plugins");
                stale.retire().await;
                self.spawn(set)?
            }
            None => self.spawn(set)?,
        };
        Ok(Lease {
            worker,
            _permit: permit,
        })
    }

    /// Return a slot after its job ended.
    ///
    /// The worker goes back to the idle set if it is still usable; otherwise
    /// a fresh worker takes its place. Capacity is released only after that.
    pub async fn release_and_replace(&self, lease: Lease, end: JobEnd) -> Result<(), PoolError> {
        let Lease { worker, _permit } = lease;
        let id = worker.id;

        match &end {
            JobEnd::Finished if self.command.policy == PoolPolicy::Reuse => {
                self.push_idle(worker);
                return Ok(());
            }
            JobEnd::Finished => {}
            JobEnd::Exited(status) => match status.code() {
                Some(0) => debug!(worker = id, "worker finished"),
                Some(code) => match Reload::from_exit_code(code) {
                    Some(reload) => {
                        let set = match reload {
                            Reload::Restart => PluginSet::Default,
                            Reload::RestartSafe => PluginSet::Safe,
                        };
                        info!(worker = id, code, ?set, "worker requested a restart");
                        if let Ok(mut current) = self.set.lock() {
                            *current = set;
                        }
                    }
                    None => error!(worker = id, code, "worker exited with an error"),
                },
                None => error!(worker = id, %status, "worker was killed"),
            },
            JobEnd::Lost(e) => error!(worker = id, error = %e, "lost contact with worker"),
        }

        worker.retire().await;
        let fresh = self.spawn(self.current_set())?;
        self.push_idle(fresh);
        Ok(())
    }

    /// Stop handing out workers and kill the idle ones.
    pub async fn shutdown(&self) {
        self.permits.close();
        let idle: Vec<WorkerProcess> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for worker in idle {
            worker.retire().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(policy: PoolPolicy) -> WorkerCommand {
        WorkerCommand {
            program: PathBuf::from("voca"),
            global_args: vec!["--config".into(), "voca.toml".into()],
            worker_args: vec!["--executor".into(), "log".into()],
            plugins: vec!["basic".into(), "math".into()],
            safe_plugins: vec!["control".into()],
            policy,
        }
    }

    #[test]
    fn test_worker_args() {
        assert_eq!(
            command(PoolPolicy::Replace).args(PluginSet::Default),
            vec![
                "--config", "voca.toml", "worker", "--executor", "log", "-i", "basic", "-i",
                "math", "--once"
            ]
        );
        assert_eq!(
            command(PoolPolicy::Reuse).args(PluginSet::Safe),
            vec!["--config", "voca.toml", "worker", "--executor", "log", "-i", "control"]
        );
    }

    /// A shell script standing in for `voca worker`
    fn script(body: &str, policy: PoolPolicy) -> WorkerCommand {
        WorkerCommand {
            program: PathBuf::from("sh"),
            global_args: vec!["-c".into(), body.into(), "sh".into()],
            worker_args: Vec::new(),
            plugins: Vec::new(),
            safe_plugins: Vec::new(),
            policy,
        }
    }

    #[tokio::test]
    async fn test_replace_policy_relays_output_and_respawns() {
        let (tx, rx) = flume::unbounded();
        let pool = Pool::start(
            script("read line; echo \"got $line\"", PoolPolicy::Replace),
            1,
            tx,
        )
        .unwrap();

        let mut lease = pool.acquire().await.unwrap();
        let first_id = lease.worker.id;
        let end = lease.worker.run_job(b"hello\n", "id-1", PoolPolicy::Replace).await;
        assert!(matches!(&end, JobEnd::Exited(status) if status.success()));
        pool.release_and_replace(lease, end).await.unwrap();

        assert_eq!(rx.recv_async().await.unwrap(), b"got hello\n");

        let lease = pool.acquire().await.unwrap();
        assert_ne!(lease.worker.id, first_id);
        drop(lease);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_reuse_policy_keeps_worker_after_marker() {
        let (tx, rx) = flume::unbounded();
        let body = r#"while read line; do echo "log $line"; echo "{\"job_finished\":\"$line\"}"; done"#;
        let pool = Pool::start(script(body, PoolPolicy::Reuse), 1, tx).unwrap();

        for id in ["a", "b"] {
            let mut lease = pool.acquire().await.unwrap();
            assert_eq!(lease.worker.id, 1);
            let line = format!("{id}\n");
            let end = lease.worker.run_job(line.as_bytes(), id, PoolPolicy::Reuse).await;
            assert!(matches!(end, JobEnd::Finished));
            pool.release_and_replace(lease, end).await.unwrap();
        }

        assert_eq!(rx.recv_async().await.unwrap(), b"log a\n");
        assert_eq!(rx.recv_async().await.unwrap(), b"log b\n");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_safe_exit_switches_plugin_set() {
        let (tx, _rx) = flume::unbounded();
        let pool = Pool::start(script("read line; exit 4", PoolPolicy::Replace), 1, tx).unwrap();

        let mut lease = pool.acquire().await.unwrap();
        let end = lease.worker.run_job(b"x\n", "x", PoolPolicy::Replace).await;
        assert!(matches!(&end, JobEnd::Exited(status) if status.code() == Some(4)));
        pool.release_and_replace(lease, end).await.unwrap();
        assert_eq!(pool.current_set(), PluginSet::Safe);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.worker.set, PluginSet::Safe);
        drop(lease);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let (tx, _rx) = flume::unbounded();
        let mut command = script("", PoolPolicy::Replace);
        command.program = PathBuf::from("/nonexistent/voca-worker");
        assert!(matches!(
            Pool::start(command, 2, tx),
            Err(PoolError::Spawn { .. })
        ));
    }
}
