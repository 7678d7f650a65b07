//! WebSocket message types exchanged with collaborating clients.
//!
//! Every frame is a JSON text message of the form `{"event": "<name>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Outbound event queue of a single connection.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// One entry of a room roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
}

// ============================================================================
// Server -> Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First frame on every connection; carries the id used for run submission.
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },

    /// Roster snapshot sent to every member whenever someone joins.
    Joined {
        members: Vec<Member>,
        #[serde(rename = "displayName")]
        display_name: String,
        #[serde(rename = "connectionId")]
        connection_id: String,
    },

    CodeChange {
        code: String,
    },

    Disconnected {
        #[serde(rename = "connectionId")]
        connection_id: String,
        #[serde(rename = "displayName")]
        display_name: String,
    },

    /// A stdout/stderr chunk or a synthetic status line.
    ProgramOutput {
        output: String,
        #[serde(rename = "runId")]
        run_id: String,
    },

    Error {
        message: String,
    },
}

// ============================================================================
// Client -> Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Join {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "displayName", alias = "username")]
        display_name: String,
    },

    CodeChange {
        code: String,
    },

    /// One line for the running program's stdin.
    ProgramInput(String),

    Leave,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_join_with_username_alias() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "join",
            "data": { "roomId": "r1", "username": "ada" }
        }))
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::Join { room_id: "r1".into(), display_name: "ada".into() }
        );
    }

    #[test]
    fn parses_raw_program_input_and_leave() {
        let input: ClientEvent =
            serde_json::from_value(json!({ "event": "program-input", "data": "42" })).unwrap();
        assert_eq!(input, ClientEvent::ProgramInput("42".into()));

        let leave: ClientEvent = serde_json::from_value(json!({ "event": "leave" })).unwrap();
        assert_eq!(leave, ClientEvent::Leave);
    }

    #[test]
    fn code_change_ignores_extra_fields() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "code-change",
            "data": { "roomId": "r1", "code": "x = 1" }
        }))
        .unwrap();
        assert_eq!(event, ClientEvent::CodeChange { code: "x = 1".into() });
    }

    #[test]
    fn serializes_program_output_in_wire_shape() {
        let event = ServerEvent::ProgramOutput { output: "hi\n".into(), run_id: "r".into() };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "event": "program-output", "data": { "output": "hi\n", "runId": "r" } })
        );
    }
}
