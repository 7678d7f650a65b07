//! Launches one sandbox process per run and drives it to a terminal state.
//!
//! Each run gets its own task set: the exit watcher (which also owns the time limit), a stdout
//! reader, a stderr reader and a stdin writer. Nothing is shared between runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::LaunchError;
use crate::run::{Run, NOTICE_STAGING_FAILED, NOTICE_UNAVAILABLE};
use crate::sandbox::SandboxRuntime;
use crate::staging::StagedDir;
use crate::stream::{spawn_input_writer, spawn_output_forwarder, InputSender};

/// How long trailing output may take to drain after the process exited on its own.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for a killed process to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Supervisor {
    runtime: SandboxRuntime,
    staging_root: PathBuf,
}

impl Supervisor {
    pub fn new(runtime: SandboxRuntime, staging_root: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            staging_root: staging_root.into(),
        }
    }

    /// Stage and launch `run` in the background, then watch it until it finishes.
    pub fn start(&self, run: Arc<Run>, code: String) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            if let Some(process) = supervisor.launch(&run, &code).await {
                supervise(run, process).await;
            }
        })
    }

    async fn launch(&self, run: &Arc<Run>, code: &str) -> Option<Launched> {
        let gate = match run.begin_launch().await {
            Some(gate) => gate,
            None => {
                debug!(run = %run.id(), "Run finished before launch");
                return None;
            }
        };

        let staged =
            match StagedDir::create(&self.staging_root, run.session_id(), run.language(), code).await {
                Ok(staged) => staged,
                Err(e) => {
                    warn!(run = %run.id(), "Staging failed: {}", e);
                    drop(gate);
                    run.fail_to_start(NOTICE_STAGING_FAILED).await;
                    return None;
                }
            };

        let mut cmd = self.runtime.command(&staged, run.language(), run.id());
        let stop = self.runtime.stop_command(&staged, run.language(), run.id());
        debug!(run = %run.id(), command = ?cmd, "Launching sandbox");

        let spawned = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.runtime.program.clone(),
            source,
        });
        run.attach_staged(staged);

        let launched = spawned.and_then(|child| Launched::wire(run, child));
        match launched {
            Ok(launched) => {
                run.attach_process(launched.child.id(), launched.input.clone(), stop);
                info!(
                    run = %run.id(),
                    session = %run.session_id(),
                    language = %run.language(),
                    pid = ?launched.child.id(),
                    "Sandbox started"
                );
                drop(gate);
                Some(launched)
            }
            Err(e) => {
                warn!(run = %run.id(), "Sandbox launch failed: {}", e);
                drop(gate);
                run.fail_to_start(NOTICE_UNAVAILABLE).await;
                None
            }
        }
    }
}

/// A spawned child with its stream tasks wired to the run.
struct Launched {
    child: Child,
    input: InputSender,
    readers: Vec<JoinHandle<()>>,
}

impl Launched {
    fn wire(run: &Arc<Run>, mut child: Child) -> Result<Self, LaunchError> {
        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;

        let (input, _writer) = spawn_input_writer(stdin);
        let readers = vec![
            spawn_output_forwarder(stdout, run.sink().clone(), "stdout"),
            spawn_output_forwarder(stderr, run.sink().clone(), "stderr"),
        ];
        Ok(Self { child, input, readers })
    }
}

/// Wait for whichever comes first: natural exit, the deadline, or another terminal transition
/// (cancellation). The timer is dropped as soon as this returns.
async fn supervise(run: Arc<Run>, launched: Launched) {
    let Launched { mut child, input, mut readers } = launched;
    drop(input);
    let deadline = Instant::now() + run.time_limit();

    tokio::select! {
        status = child.wait() => {
            let exit_code = match status {
                Ok(status) => {
                    debug!(run = %run.id(), %status, "Sandbox exited");
                    status.code()
                }
                Err(e) => {
                    warn!(run = %run.id(), "Error waiting for sandbox: {}", e);
                    None
                }
            };
            if timeout(DRAIN_GRACE, join_all(readers.iter_mut())).await.is_err() {
                debug!(run = %run.id(), "Output still open after exit, dropping remainder");
            }
            run.complete(exit_code).await;
        }
        _ = sleep_until(deadline) => {
            info!(run = %run.id(), limit_secs = run.time_limit().as_secs_f64(), "Time limit exceeded");
            run.time_out().await;
        }
        _ = run.finished() => {}
    }

    // Reap whatever teardown killed.
    if timeout(REAP_GRACE, child.wait()).await.is_err() {
        warn!(run = %run.id(), "Sandbox did not exit after kill");
        let _ = child.start_kill();
    }
    for reader in readers {
        reader.abort();
    }
}
