//! Request gateway: admission control for execution requests and input forwarding.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::SubmitError;
use crate::language::Language;
use crate::relay::Relay;
use crate::run::{Run, RunStatus};
use crate::supervisor::Supervisor;

/// Execution request as it arrives on the wire. Every field may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, rename = "connectionId", alias = "socketId")]
    pub connection_id: Option<String>,
}

/// A validated request. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    pub session_id: String,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, SubmitError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(SubmitError::MissingField(field))
}

impl TryFrom<SubmitRequest> for ExecutionRequest {
    type Error = SubmitError;

    fn try_from(req: SubmitRequest) -> Result<Self, Self::Error> {
        let code = required(req.code, "code")?;
        let language = required(req.language, "language")?;
        let session_id = required(req.connection_id, "connectionId")?;
        Ok(Self {
            code,
            language: language.parse()?,
            session_id,
        })
    }
}

/// Admission receipt for an accepted run. Results arrive as `program-output` events.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run: Arc<Run>,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        self.run.id()
    }

    pub fn session_id(&self) -> &str {
        self.run.session_id()
    }

    pub fn status(&self) -> RunStatus {
        self.run.status()
    }

    /// Wait until the run reached a terminal state and was cleaned up.
    pub async fn finished(&self) -> RunStatus {
        self.run.finished().await;
        self.run.status()
    }
}

pub struct Gateway {
    relay: Arc<Relay>,
    supervisor: Supervisor,
    time_limit: Duration,
}

impl Gateway {
    pub fn new(relay: Arc<Relay>, supervisor: Supervisor, time_limit: Duration) -> Self {
        Self {
            relay,
            supervisor,
            time_limit,
        }
    }

    /// Admit a run for the session and start it in the background. Returns without waiting
    /// for the program.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<RunHandle, SubmitError> {
        let session = self
            .relay
            .session(&request.session_id)
            .await
            .ok_or_else(|| SubmitError::UnknownSession(request.session_id.clone()))?;

        let run = Run::new(
            &session.id,
            request.language,
            self.time_limit,
            session.events.clone(),
            &session.runs,
        );
        if let Err(rejected) = session.runs.claim(run.clone()) {
            debug!(session = %session.id, rejected = %rejected.id(), "Run rejected, one already active");
            return Err(SubmitError::AlreadyRunning(session.id));
        }

        info!(
            run = %run.id(),
            session = %session.id,
            language = %request.language,
            bytes = request.code.len(),
            "Run admitted"
        );
        self.supervisor.start(run.clone(), request.code);
        Ok(RunHandle { run })
    }

    /// Send a line to the session's running program. Without one, nothing happens.
    pub async fn send_input(&self, session_id: &str, text: &str) -> bool {
        let Some(run) = self
            .relay
            .session(session_id)
            .await
            .and_then(|session| session.runs.current())
        else {
            return false;
        };
        if !run.write_input(text) {
            return false;
        }
        // Move the client's terminal view past the echoed input.
        run.sink().send("\n");
        true
    }
}
