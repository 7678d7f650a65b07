//! One sandboxed execution attempt and its single-transition lifecycle.
//!
//! `pending -> running -> {completed, timed-out, cancelled}` or `pending -> failed-to-start`.
//! The status lives in an atomic and every terminal transition goes through a compare-and-set,
//! so whichever of exit, timeout or cancellation arrives first performs teardown and the rest
//! are no-ops.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::{MutexGuard, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::language::Language;
use crate::protocol::EventSender;
use crate::staging::StagedDir;
use crate::stream::{InputSender, OutputSink};

pub const NOTICE_COMPLETE: &str = "\n***********Execution Complete***********\n";
pub const NOTICE_CANCELLED: &str = "\n***********Execution Cancelled***********\n";
pub const NOTICE_UNAVAILABLE: &str = "Error: Compilation service temporarily unavailable\n";
pub const NOTICE_STAGING_FAILED: &str = "Error: Unable to prepare workspace for execution\n";

pub fn timeout_notice(limit: Duration) -> String {
    let secs = limit.as_secs();
    let human = if secs >= 60 && secs % 60 == 0 {
        let minutes = secs / 60;
        format!("{} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else if limit.subsec_millis() == 0 {
        format!("{} second{}", secs, if secs == 1 { "" } else { "s" })
    } else {
        format!("{:.1} seconds", limit.as_secs_f64())
    };
    format!("\n***********Process Terminated: Time Limit Exceeded ({})***********\n", human)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum RunStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    TimedOut = 3,
    FailedToStart = 4,
    Cancelled = 5,
}

impl RunStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::TimedOut,
            4 => Self::FailedToStart,
            5 => Self::Cancelled,
            other => unreachable!("invalid run status byte {}", other),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::TimedOut => "timed-out",
            Self::FailedToStart => "failed-to-start",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A session's single run-ownership slot.
#[derive(Debug, Default)]
pub struct RunSlot {
    current: Mutex<Option<Arc<Run>>>,
}

impl RunSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take ownership for `run`; hands the run back if the slot is occupied.
    pub fn claim(&self, run: Arc<Run>) -> Result<(), Arc<Run>> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_some() {
            return Err(run);
        }
        *current = Some(run);
        Ok(())
    }

    pub fn current(&self) -> Option<Arc<Run>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Clear the slot if it still belongs to `run_id`.
    fn release(&self, run_id: &str) -> bool {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(run) if run.id() == run_id => {
                *current = None;
                true
            }
            _ => false,
        }
    }
}

/// Resources a running sandbox holds. Taken exactly once, on terminal entry.
#[derive(Debug, Default)]
struct Attached {
    staged: Option<StagedDir>,
    pid: Option<u32>,
    input: Option<InputSender>,
    stop: Option<Command>,
}

#[derive(Debug)]
pub struct Run {
    id: String,
    session_id: String,
    language: Language,
    started_at: Instant,
    time_limit: Duration,
    status: AtomicU8,
    sink: Arc<OutputSink>,
    attached: Mutex<Attached>,
    launch_gate: tokio::sync::Mutex<()>,
    slot: Weak<RunSlot>,
    settled: AtomicBool,
    settled_notify: Notify,
}

impl Run {
    pub fn new(
        session_id: impl Into<String>,
        language: Language,
        time_limit: Duration,
        events: EventSender,
        slot: &Arc<RunSlot>,
    ) -> Arc<Self> {
        let id = Uuid::new_v4().to_string();
        Arc::new(Self {
            sink: Arc::new(OutputSink::new(id.clone(), events)),
            id,
            session_id: session_id.into(),
            language,
            started_at: Instant::now(),
            time_limit,
            status: AtomicU8::new(RunStatus::Pending as u8),
            attached: Mutex::new(Attached::default()),
            launch_gate: tokio::sync::Mutex::new(()),
            slot: Arc::downgrade(slot),
            settled: AtomicBool::new(false),
            settled_notify: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    pub fn status(&self) -> RunStatus {
        RunStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.status() == RunStatus::Running
    }

    pub fn sink(&self) -> &Arc<OutputSink> {
        &self.sink
    }

    /// Enter the launch section. `None` if the run already finished and nothing may be staged.
    ///
    /// Teardown waits for an open launch section before it collects resources, so anything
    /// attached while the guard is held is always torn down, even if the run was cancelled
    /// halfway through the launch.
    pub async fn begin_launch(&self) -> Option<MutexGuard<'_, ()>> {
        let gate = self.launch_gate.lock().await;
        if self.status() != RunStatus::Pending {
            return None;
        }
        Some(gate)
    }

    /// Hand the staged directory to the run. Call inside the launch section.
    pub fn attach_staged(&self, staged: StagedDir) {
        let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        attached.staged = Some(staged);
    }

    /// Bind the launched process and move to `running`. Call inside the launch section.
    pub fn attach_process(&self, pid: Option<u32>, input: InputSender, stop: Option<Command>) {
        {
            let mut attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
            attached.pid = pid;
            attached.input = Some(input);
            attached.stop = stop;
        }
        let started = self
            .status
            .compare_exchange(
                RunStatus::Pending as u8,
                RunStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        debug!(run = %self.id, pid = ?pid, started, "Process attached");
    }

    /// Queue one line for the program's stdin. Dropped unless the run is running.
    pub fn write_input(&self, line: impl Into<String>) -> bool {
        if !self.is_running() {
            return false;
        }
        let attached = self.attached.lock().unwrap_or_else(|e| e.into_inner());
        match attached.input.as_ref() {
            Some(input) => input.send(line.into()).is_ok(),
            None => false,
        }
    }

    /// Natural process exit.
    pub async fn complete(&self, exit_code: Option<i32>) -> bool {
        let notice = match exit_code {
            Some(0) => NOTICE_COMPLETE.to_string(),
            Some(code) => format!("\n***********Execution Complete (exit code {})***********\n", code),
            None => "\n***********Execution Complete (terminated by signal)***********\n".to_string(),
        };
        self.finish(RunStatus::Completed, Some(&notice)).await
    }

    /// Time limit reached: kill the process and report it.
    pub async fn time_out(&self) -> bool {
        let notice = timeout_notice(self.time_limit);
        self.finish(RunStatus::TimedOut, Some(&notice)).await
    }

    /// Owner went away or left the room.
    pub async fn cancel(&self) -> bool {
        self.finish(RunStatus::Cancelled, Some(NOTICE_CANCELLED)).await
    }

    /// Staging or launch failed; no process is running.
    pub async fn fail_to_start(&self, notice: &str) -> bool {
        self.finish(RunStatus::FailedToStart, Some(notice)).await
    }

    /// Resolves once the run reached a terminal state and its teardown finished.
    pub async fn finished(&self) {
        loop {
            let notified = self.settled_notify.notified();
            if self.settled.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    fn transition(&self, to: RunStatus) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if RunStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.status.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    async fn finish(&self, to: RunStatus, notice: Option<&str>) -> bool {
        if !self.transition(to) {
            debug!(run = %self.id, attempted = %to, current = %self.status(), "Run already finished");
            return false;
        }

        self.sink.close(notice);

        let _gate = self.launch_gate.lock().await;
        let attached = {
            let mut guard = self.attached.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        // The leader may have exited already; anything it left running in its group goes too.
        if let Some(pid) = attached.pid {
            kill_process_group(pid);
        }
        if matches!(to, RunStatus::TimedOut | RunStatus::Cancelled) {
            if let Some(mut stop) = attached.stop {
                match stop.status().await {
                    Ok(status) if !status.success() => {
                        debug!(run = %self.id, %status, "Sandbox stop command failed")
                    }
                    Err(e) => warn!(run = %self.id, "Unable to run sandbox stop command: {}", e),
                    _ => {}
                }
            }
        }
        drop(attached.input);

        if let Some(staged) = attached.staged {
            staged.remove().await;
        }

        if let Some(slot) = self.slot.upgrade() {
            slot.release(&self.id);
        }

        info!(
            run = %self.id,
            session = %self.session_id,
            language = %self.language,
            status = %to,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "Run finished"
        );

        self.settled.store(true, Ordering::Release);
        self.settled_notify.notify_waiters();
        true
    }
}

#[cfg(target_os = "linux")]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, "Failed to kill sandbox process group: {}", e),
    }
}
