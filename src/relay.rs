//! Session relay: who is connected, which room they are in, and fan-out between them.
//!
//! Every live connection has one explicit record holding its display name, current room, outbound
//! event queue and run-ownership slot. Rooms are just ordered member lists, created on first join
//! and dropped when the last member leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::{EventSender, Member, ServerEvent};
use crate::run::RunSlot;

#[derive(Debug)]
struct Session {
    display_name: String,
    room: Option<String>,
    events: EventSender,
    runs: Arc<RunSlot>,
    connected_at: Instant,
}

#[derive(Debug, Default)]
struct RelayState {
    sessions: HashMap<String, Session>,
    /// Room id -> member connection ids in join order.
    rooms: HashMap<String, Vec<String>>,
}

impl RelayState {
    fn roster(&self, room_id: &str) -> Vec<Member> {
        self.rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| {
                        self.sessions.get(id).map(|s| Member {
                            connection_id: id.clone(),
                            display_name: s.display_name.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliver `event` to every member of `room_id` except `skip`. Returns how many got it.
    fn broadcast(&self, room_id: &str, event: &ServerEvent, skip: Option<&str>) -> usize {
        let Some(members) = self.rooms.get(room_id) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| Some(id.as_str()) != skip)
            .filter_map(|id| self.sessions.get(id))
            .filter(|s| s.events.send(event.clone()).is_ok())
            .count()
    }

    /// Take `conn_id` out of its room and tell the rest. Returns the room it left.
    fn remove_from_room(&mut self, conn_id: &str) -> Option<String> {
        let session = self.sessions.get_mut(conn_id)?;
        let room_id = session.room.take()?;
        let display_name = session.display_name.clone();

        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.retain(|id| id != conn_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
                debug!(room = %room_id, "Room empty, dropped");
            }
        }

        let notice = ServerEvent::Disconnected {
            connection_id: conn_id.to_string(),
            display_name,
        };
        self.broadcast(&room_id, &notice, None);
        Some(room_id)
    }
}

/// Everything the gateway needs to act for one connection.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: String,
    pub events: EventSender,
    pub runs: Arc<RunSlot>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub display_name: String,
    pub room_id: Option<String>,
    pub running: bool,
    pub age_secs: u64,
}

#[derive(Debug, Default)]
pub struct Relay {
    state: RwLock<RelayState>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and greet it with its id.
    pub async fn connect(&self, events: EventSender) -> String {
        let id = Uuid::new_v4().to_string();
        let _ = events.send(ServerEvent::Connected { connection_id: id.clone() });
        let session = Session {
            display_name: String::new(),
            room: None,
            events,
            runs: RunSlot::new(),
            connected_at: Instant::now(),
        };
        self.state.write().await.sessions.insert(id.clone(), session);
        info!("Connected: {}", id);
        id
    }

    /// Put the connection in `room_id` and send the new roster to every member, joiner included.
    ///
    /// Joining the room one is already in only refreshes the display name and re-sends the roster.
    /// Joining another room leaves the current one first.
    pub async fn join(
        &self,
        conn_id: &str,
        room_id: &str,
        display_name: &str,
    ) -> Result<Vec<Member>, RelayError> {
        if room_id.trim().is_empty() {
            return Err(RelayError::InvalidRoom);
        }

        let mut state = self.state.write().await;
        let current_room = state
            .sessions
            .get(conn_id)
            .ok_or_else(|| RelayError::UnknownSession(conn_id.to_string()))?
            .room
            .clone();

        if current_room.as_deref().is_some_and(|r| r != room_id) {
            state.remove_from_room(conn_id);
        }

        if let Some(session) = state.sessions.get_mut(conn_id) {
            session.display_name = display_name.to_string();
            session.room = Some(room_id.to_string());
        }
        let members = state.rooms.entry(room_id.to_string()).or_default();
        if !members.iter().any(|id| id == conn_id) {
            members.push(conn_id.to_string());
        }

        let roster = state.roster(room_id);
        let joined = ServerEvent::Joined {
            members: roster.clone(),
            display_name: display_name.to_string(),
            connection_id: conn_id.to_string(),
        };
        state.broadcast(room_id, &joined, None);

        info!(room = %room_id, members = roster.len(), "{} ({}) joined", display_name, conn_id);
        Ok(roster)
    }

    /// Relay an edit to everyone else in the sender's room. No room means nobody to tell.
    pub async fn code_change(&self, conn_id: &str, code: &str) -> Result<usize, RelayError> {
        let state = self.state.read().await;
        let session = state
            .sessions
            .get(conn_id)
            .ok_or_else(|| RelayError::UnknownSession(conn_id.to_string()))?;
        let Some(room_id) = session.room.as_deref() else {
            return Ok(0);
        };
        let event = ServerEvent::CodeChange { code: code.to_string() };
        Ok(state.broadcast(room_id, &event, Some(conn_id)))
    }

    /// Leave the current room and cancel the connection's run, if any.
    pub async fn leave(&self, conn_id: &str) -> Result<(), RelayError> {
        let runs = {
            let mut state = self.state.write().await;
            let runs = state
                .sessions
                .get(conn_id)
                .map(|s| s.runs.clone())
                .ok_or_else(|| RelayError::UnknownSession(conn_id.to_string()))?;
            if let Some(room_id) = state.remove_from_room(conn_id) {
                info!(room = %room_id, "{} left", conn_id);
            }
            runs
        };

        if let Some(run) = runs.current() {
            run.cancel().await;
        }
        Ok(())
    }

    /// Connection closed: leave, cancel, forget.
    pub async fn disconnect(&self, conn_id: &str) {
        if self.leave(conn_id).await.is_err() {
            return;
        }
        self.state.write().await.sessions.remove(conn_id);
        info!("Disconnected: {}", conn_id);
    }

    pub async fn roster(&self, room_id: &str) -> Vec<Member> {
        self.state.read().await.roster(room_id)
    }

    pub async fn session(&self, conn_id: &str) -> Option<SessionHandle> {
        self.state.read().await.sessions.get(conn_id).map(|s| SessionHandle {
            id: conn_id.to_string(),
            events: s.events.clone(),
            runs: s.runs.clone(),
        })
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.state.read().await;
        let now = Instant::now();
        let mut list: Vec<SessionInfo> = state
            .sessions
            .iter()
            .map(|(id, s)| SessionInfo {
                id: id.clone(),
                display_name: s.display_name.clone(),
                room_id: s.room.clone(),
                running: s.runs.current().is_some(),
                age_secs: now.duration_since(s.connected_at).as_secs(),
            })
            .collect();
        list.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then_with(|| a.id.cmp(&b.id)));
        list
    }
}
