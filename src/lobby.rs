//! Real-time lobby hub: who is waiting on which project, readiness flags,
//! and fan-out of lobby events to every connected socket.
//!
//! Lobbies live only in memory. Each lobby's mutations run under its own
//! mutex; frames go out through per-connection unbounded channels so a slow
//! socket never blocks the lobby.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{LobbyStatus, Presence, Readiness};
use crate::protocol::{LobbySnapshot, ServerEvent, ServerFrame};

/// How long a completed lobby lingers before it is torn down.
const COMPLETE_CLOSE_DELAY: Duration = Duration::from_secs(5);

/// Why a student could not join.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("Lobby not found")]
    NotFound,
    #[error("Lobby is full")]
    Full,
    #[error("Test already started")]
    AlreadyStarted,
}

/// Sending half of one connection's outbound queue. Sends never block;
/// frames queued to a dropped connection are discarded.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<ServerFrame>,
}

impl ClientHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, frame: ServerFrame) {
        // a closed receiver just means the socket is gone
        let _ = self.tx.send(frame);
    }

    fn is_same_connection(&self, other: &ClientHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

struct LobbyInner {
    project_id: Uuid,
    max_students: usize,
    status: LobbyStatus,
    teacher: Option<(Uuid, ClientHandle)>,
    students: HashMap<Uuid, (Presence, ClientHandle)>,
    join_order: Vec<Uuid>,
}

impl LobbyInner {
    fn snapshot(&self) -> LobbySnapshot {
        let students: Vec<Presence> = self
            .join_order
            .iter()
            .filter_map(|id| self.students.get(id).map(|(p, _)| p.clone()))
            .collect();
        LobbySnapshot {
            project_id: self.project_id,
            status: self.status,
            student_count: students.len(),
            students,
            max_students: self.max_students,
        }
    }

    fn broadcast(&self, frame: ServerFrame) {
        if let Some((_, handle)) = &self.teacher {
            handle.send(frame.clone());
        }
        for (_, handle) in self.students.values() {
            handle.send(frame.clone());
        }
    }

    fn broadcast_except(&self, skip: Uuid, frame: ServerFrame) {
        if let Some((_, handle)) = &self.teacher {
            handle.send(frame.clone());
        }
        for (presence, handle) in self.students.values() {
            if presence.user_id != skip {
                handle.send(frame.clone());
            }
        }
    }

    fn broadcast_update(&self) {
        self.broadcast(ServerFrame::now(ServerEvent::LobbyUpdate(self.snapshot())));
    }

    fn remove_and_announce(&mut self, user_id: Uuid) {
        let Some((presence, _)) = self.students.remove(&user_id) else { return };
        self.join_order.retain(|id| *id != user_id);
        info!(target: "lobby", project_id = %self.project_id, %user_id, "student left lobby");
        self.broadcast(ServerFrame::now(ServerEvent::StudentLeft {
            user_id,
            name: presence.name,
        }));
        self.broadcast_update();
    }
}

pub struct Lobby {
    inner: Mutex<LobbyInner>,
}

/// All live lobbies, one per project.
#[derive(Clone, Default)]
pub struct LobbyRegistry {
    lobbies: Arc<RwLock<HashMap<Uuid, Arc<Lobby>>>>,
}

impl LobbyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, project_id: Uuid) -> Option<Arc<Lobby>> {
        self.lobbies.read().await.get(&project_id).cloned()
    }

    pub async fn contains(&self, project_id: Uuid) -> bool {
        self.lobbies.read().await.contains_key(&project_id)
    }

    /// Register the teacher connection, creating the lobby if absent. A
    /// second teacher connection replaces the first; the old one is told
    /// why and then dropped.
    #[instrument(level = "debug", skip(self, handle))]
    pub async fn connect_teacher(
        &self,
        project_id: Uuid,
        teacher_id: Uuid,
        max_students: usize,
        handle: ClientHandle,
    ) {
        let lobby = {
            let mut lobbies = self.lobbies.write().await;
            lobbies
                .entry(project_id)
                .or_insert_with(|| {
                    info!(target: "lobby", %project_id, max_students, "lobby created");
                    Arc::new(Lobby {
                        inner: Mutex::new(LobbyInner {
                            project_id,
                            max_students,
                            status: LobbyStatus::Waiting,
                            teacher: None,
                            students: HashMap::new(),
                            join_order: Vec::new(),
                        }),
                    })
                })
                .clone()
        };
        let mut inner = lobby.inner.lock().await;
        if let Some((_, old)) = inner.teacher.take() {
            old.send(ServerFrame::now(ServerEvent::Error {
                message: "Replaced by a new teacher connection".into(),
            }));
        }
        handle.send(ServerFrame::now(ServerEvent::LobbyUpdate(inner.snapshot())));
        inner.teacher = Some((teacher_id, handle));
    }

    /// Add a student to a waiting lobby and announce them. The joiner
    /// sees the resulting `lobby_update` but not their own join event.
    #[instrument(level = "debug", skip(self, presence, handle), fields(user_id = %presence.user_id))]
    pub async fn connect_student(
        &self,
        project_id: Uuid,
        presence: Presence,
        handle: ClientHandle,
    ) -> Result<(), JoinError> {
        let lobby = self.get(project_id).await.ok_or(JoinError::NotFound)?;
        let mut inner = lobby.inner.lock().await;
        if inner.status != LobbyStatus::Waiting {
            return Err(JoinError::AlreadyStarted);
        }
        let user_id = presence.user_id;
        let reconnect = inner.students.contains_key(&user_id);
        if !reconnect && inner.students.len() >= inner.max_students {
            return Err(JoinError::Full);
        }
        if !reconnect {
            inner.join_order.push(user_id);
        }
        inner.students.insert(user_id, (presence.clone(), handle));
        info!(target: "lobby", %project_id, %user_id, reconnect, "student joined lobby");
        if !reconnect {
            inner.broadcast_except(
                user_id,
                ServerFrame::now(ServerEvent::StudentJoined(presence)),
            );
        }
        inner.broadcast_update();
        Ok(())
    }

    /// Flip one student's readiness. Unknown lobby or student is a no-op.
    pub async fn set_ready(&self, project_id: Uuid, user_id: Uuid, status: Readiness) {
        let Some(lobby) = self.get(project_id).await else { return };
        let mut inner = lobby.inner.lock().await;
        let Some((presence, _)) = inner.students.get_mut(&user_id) else { return };
        presence.status = status;
        debug!(target: "lobby", %project_id, %user_id, ?status, "readiness changed");
        inner.broadcast(ServerFrame::now(ServerEvent::StudentReady { user_id, status }));
        inner.broadcast_update();
    }

    /// Remove a student and announce it. Idempotent.
    #[instrument(level = "debug", skip(self))]
    pub async fn disconnect_student(&self, project_id: Uuid, user_id: Uuid) {
        let Some(lobby) = self.get(project_id).await else { return };
        lobby.inner.lock().await.remove_and_announce(user_id);
    }

    /// Socket-close path: remove the student only if the registered
    /// connection is still this one, so a reconnect is not torn down by
    /// its predecessor's cleanup.
    pub async fn disconnect_student_if_current(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        handle: &ClientHandle,
    ) {
        let Some(lobby) = self.get(project_id).await else { return };
        let mut inner = lobby.inner.lock().await;
        match inner.students.get(&user_id) {
            Some((_, current)) if current.is_same_connection(handle) => {}
            _ => return,
        }
        inner.remove_and_announce(user_id);
    }

    /// Teacher kicked a student: tell them, then run the leave path.
    #[instrument(level = "debug", skip(self))]
    pub async fn kick_student(&self, project_id: Uuid, user_id: Uuid) {
        let Some(lobby) = self.get(project_id).await else { return };
        let mut inner = lobby.inner.lock().await;
        if let Some((_, handle)) = inner.students.get(&user_id) {
            handle.send(ServerFrame::now(ServerEvent::Error {
                message: "Removed from lobby by teacher".into(),
            }));
        }
        inner.remove_and_announce(user_id);
    }

    /// Clear the teacher slot when their socket closes; the lobby itself
    /// stays up so students keep their places.
    pub async fn disconnect_teacher_if_current(&self, project_id: Uuid, handle: &ClientHandle) {
        let Some(lobby) = self.get(project_id).await else { return };
        let mut inner = lobby.inner.lock().await;
        if let Some((_, current)) = &inner.teacher {
            if current.is_same_connection(handle) {
                inner.teacher = None;
            }
        }
    }

    /// Move a waiting lobby to active and announce the start. Returns
    /// false (and changes nothing) if the lobby is past waiting.
    #[instrument(level = "debug", skip(self))]
    pub async fn start_test(&self, project_id: Uuid) -> bool {
        let Some(lobby) = self.get(project_id).await else { return false };
        let mut inner = lobby.inner.lock().await;
        if inner.status != LobbyStatus::Waiting {
            return false;
        }
        inner.status = LobbyStatus::Active;
        info!(target: "lobby", %project_id, students = inner.students.len(), "test started");
        inner.broadcast(ServerFrame::now(ServerEvent::TestStarted {
            project_id,
            started_at: chrono::Utc::now(),
        }));
        inner.broadcast_update();
        true
    }

    /// Mark the test finished and schedule lobby teardown after a short
    /// grace delay, so clients can render the final state.
    #[instrument(level = "debug", skip(self))]
    pub async fn complete_test(&self, project_id: Uuid) -> bool {
        let Some(lobby) = self.get(project_id).await else { return false };
        {
            let mut inner = lobby.inner.lock().await;
            inner.status = LobbyStatus::Completed;
            info!(target: "lobby", %project_id, "test completed");
            inner.broadcast(ServerFrame::now(ServerEvent::TestCompleted { project_id }));
        }
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COMPLETE_CLOSE_DELAY).await;
            registry.close_lobby(project_id).await;
        });
        true
    }

    /// Tear the lobby down: tell everyone, then drop all connections.
    #[instrument(level = "debug", skip(self))]
    pub async fn close_lobby(&self, project_id: Uuid) {
        let Some(lobby) = self.lobbies.write().await.remove(&project_id) else { return };
        let inner = lobby.inner.lock().await;
        info!(target: "lobby", %project_id, students = inner.students.len(), "lobby closed");
        inner.broadcast(ServerFrame::now(ServerEvent::LobbyClosed {
            project_id,
            reason: "Lobby closed by teacher".into(),
        }));
        // dropping the lobby drops every ClientHandle, which ends each
        // connection's send loop
    }
}
