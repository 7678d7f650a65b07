//! Codebridge - shared code rooms with sandboxed, live-streamed execution.
//!
//! Collaborators join a room over WebSocket and see each other's edits. Any of them can submit the
//! current code; it is staged into a fresh directory, run by an external sandbox runtime, and its
//! output streams back to the submitting connection while input lines flow the other way.

#[cfg(not(target_os = "linux"))]
compile_error!("codebridge only works on Linux.");

pub mod config;
pub mod error;
pub mod gateway;
pub mod http_server;
pub mod language;
pub mod protocol;
pub mod relay;
pub mod run;
pub mod sandbox;
pub mod security;
pub mod staging;
pub mod state;
pub mod stream;
pub mod supervisor;

pub use config::Config;
pub use gateway::{ExecutionRequest, Gateway, RunHandle};
pub use language::Language;
pub use relay::Relay;
pub use run::{Run, RunStatus};
pub use sandbox::SandboxRuntime;
pub use state::AppState;
pub use supervisor::Supervisor;
