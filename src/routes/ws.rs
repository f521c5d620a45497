//! Lobby WebSocket endpoints. Each socket is identity-checked on upgrade,
//! registered with the lobby hub, then pumped: lobby frames go out through
//! the connection's channel, client actions are parsed and dispatched.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    Path, Query, State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use chrono::Utc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::domain::{Presence, ProjectStatus, Readiness, Role};
use crate::lobby::ClientHandle;
use crate::protocol::{ClientWsMessage, Identity, ServerEvent, ServerFrame};
use crate::state::AppState;

#[instrument(level = "info", skip(ws, state, who), fields(user_id = %who.user_id))]
pub async fn ws_teacher_upgrade(
  ws: WebSocketUpgrade,
  Path(project_id): Path<Uuid>,
  Query(who): Query<Identity>,
  State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
  info!(target: "lobby", %project_id, user_id = %who.user_id, "teacher lobby upgrade requested");
  ws.on_upgrade(move |socket| handle_teacher_socket(socket, state, project_id, who))
}

#[instrument(level = "info", skip(ws, state, who), fields(user_id = %who.user_id))]
pub async fn ws_student_upgrade(
  ws: WebSocketUpgrade,
  Path(project_id): Path<Uuid>,
  Query(who): Query<Identity>,
  State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
  info!(target: "lobby", %project_id, user_id = %who.user_id, "student lobby upgrade requested");
  ws.on_upgrade(move |socket| handle_student_socket(socket, state, project_id, who))
}

async fn handle_teacher_socket(
  mut socket: WebSocket,
  state: Arc<AppState>,
  project_id: Uuid,
  who: Identity,
) {
  if who.role != Role::Teacher {
    send_error_and_close(&mut socket, "Unauthorized").await;
    return;
  }
  let project = match state.store.project(project_id).await {
    Ok(p) => p,
    Err(_) => {
      send_error_and_close(&mut socket, "Project not found").await;
      return;
    }
  };

  let (handle, mut rx) = ClientHandle::new();
  state
    .lobbies
    .connect_teacher(project_id, who.user_id, project.max_students, handle.clone())
    .await;
  info!(target: "lobby", %project_id, teacher_id = %who.user_id, "teacher connected");

  loop {
    tokio::select! {
      frame = rx.recv() => {
        // the lobby dropped our handle: it was closed
        let Some(frame) = frame else { break };
        if !send_frame(&mut socket, &frame).await { break; }
      }
      msg = socket.recv() => {
        match msg {
          Some(Ok(Message::Text(txt))) => {
            match serde_json::from_str::<ClientWsMessage>(&txt) {
              Ok(action) => {
                if !teacher_action(&state, project_id, action, &handle).await { break; }
              }
              Err(_) => handle.send(ServerFrame::now(ServerEvent::Error {
                message: "Invalid message format".into(),
              })),
            }
          }
          Some(Ok(Message::Ping(payload))) => { let _ = socket.send(Message::Pong(payload)).await; }
          Some(Ok(Message::Close(_))) | None => break,
          Some(Ok(_)) => {}
          Some(Err(e)) => {
            error!(target: "lobby", %project_id, error = %e, "teacher socket error");
            break;
          }
        }
      }
    }
  }

  // the lobby itself stays up so students keep their places
  state.lobbies.disconnect_teacher_if_current(project_id, &handle).await;
  info!(target: "lobby", %project_id, teacher_id = %who.user_id, "teacher disconnected");
}

/// Dispatch one teacher action. Returns false when the socket loop should end.
async fn teacher_action(
  state: &AppState,
  project_id: Uuid,
  action: ClientWsMessage,
  handle: &ClientHandle,
) -> bool {
  match action {
    ClientWsMessage::StartTest => {
      if state.lobbies.start_test(project_id).await {
        // open the attempt window for this cohort
        if let Err(e) = state
          .store
          .set_project_status(project_id, ProjectStatus::Active)
          .await
        {
          error!(target: "lobby", %project_id, error = %e, "project activation failed");
        }
      } else {
        handle.send(ServerFrame::now(ServerEvent::Error {
          message: "Test already started".into(),
        }));
      }
      true
    }
    ClientWsMessage::KickStudent { user_id } => {
      state.lobbies.kick_student(project_id, user_id).await;
      true
    }
    ClientWsMessage::CompleteTest => {
      if state.lobbies.complete_test(project_id).await {
        if let Err(e) = state
          .store
          .set_project_status(project_id, ProjectStatus::Closed)
          .await
        {
          error!(target: "lobby", %project_id, error = %e, "project close failed");
        }
      }
      true
    }
    ClientWsMessage::CloseLobby => {
      state.lobbies.close_lobby(project_id).await;
      false
    }
    ClientWsMessage::Ping => {
      handle.send(ServerFrame::now(ServerEvent::Pong {}));
      true
    }
    ClientWsMessage::Ready | ClientWsMessage::NotReady | ClientWsMessage::Leave => {
      handle.send(ServerFrame::now(ServerEvent::Error {
        message: "Unauthorized".into(),
      }));
      true
    }
  }
}

async fn handle_student_socket(
  mut socket: WebSocket,
  state: Arc<AppState>,
  project_id: Uuid,
  who: Identity,
) {
  if who.role != Role::Student {
    send_error_and_close(&mut socket, "Unauthorized").await;
    return;
  }
  if state.store.project(project_id).await.is_err() {
    send_error_and_close(&mut socket, "Project not found").await;
    return;
  }

  let presence = Presence {
    user_id: who.user_id,
    name: who.name.clone(),
    email: who.email.clone(),
    status: Readiness::Waiting,
    joined_at: Utc::now(),
  };
  let (handle, mut rx) = ClientHandle::new();
  if let Err(e) = state
    .lobbies
    .connect_student(project_id, presence, handle.clone())
    .await
  {
    send_error_and_close(&mut socket, &e.to_string()).await;
    return;
  }

  loop {
    tokio::select! {
      frame = rx.recv() => {
        let Some(frame) = frame else { break };
        if !send_frame(&mut socket, &frame).await { break; }
      }
      msg = socket.recv() => {
        match msg {
          Some(Ok(Message::Text(txt))) => {
            match serde_json::from_str::<ClientWsMessage>(&txt) {
              Ok(action) => {
                if !student_action(&state, project_id, who.user_id, action, &handle).await {
                  break;
                }
              }
              Err(_) => handle.send(ServerFrame::now(ServerEvent::Error {
                message: "Invalid message format".into(),
              })),
            }
          }
          Some(Ok(Message::Ping(payload))) => { let _ = socket.send(Message::Pong(payload)).await; }
          Some(Ok(Message::Close(_))) | None => break,
          Some(Ok(_)) => {}
          Some(Err(e)) => {
            error!(target: "lobby", %project_id, user_id = %who.user_id, error = %e, "student socket error");
            break;
          }
        }
      }
    }
  }

  state
    .lobbies
    .disconnect_student_if_current(project_id, who.user_id, &handle)
    .await;
}

/// Dispatch one student action. Returns false when the socket loop should end.
async fn student_action(
  state: &AppState,
  project_id: Uuid,
  user_id: Uuid,
  action: ClientWsMessage,
  handle: &ClientHandle,
) -> bool {
  match action {
    ClientWsMessage::Ready => {
      state.lobbies.set_ready(project_id, user_id, Readiness::Ready).await;
      true
    }
    ClientWsMessage::NotReady => {
      state.lobbies.set_ready(project_id, user_id, Readiness::Waiting).await;
      true
    }
    ClientWsMessage::Leave => {
      state.lobbies.disconnect_student(project_id, user_id).await;
      false
    }
    ClientWsMessage::Ping => {
      handle.send(ServerFrame::now(ServerEvent::Pong {}));
      true
    }
    ClientWsMessage::StartTest
    | ClientWsMessage::KickStudent { .. }
    | ClientWsMessage::CompleteTest
    | ClientWsMessage::CloseLobby => {
      handle.send(ServerFrame::now(ServerEvent::Error {
        message: "Unauthorized".into(),
      }));
      true
    }
  }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
  match serde_json::to_string(frame) {
    Ok(txt) => socket.send(Message::Text(txt)).await.is_ok(),
    Err(e) => {
      error!(target: "lobby", error = %e, "frame serialization failed");
      true
    }
  }
}

async fn send_error_and_close(socket: &mut WebSocket, message: &str) {
  let frame = ServerFrame::now(ServerEvent::Error { message: message.into() });
  if let Ok(txt) = serde_json::to_string(&frame) {
    let _ = socket.send(Message::Text(txt)).await;
  }
  let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Prompts;
  use crate::domain::{Project, Question, QuestionKind};
  use crate::store::ExamStore;
  use std::collections::HashMap;
  use tokio::sync::mpsc;

  fn seeded_state() -> (AppState, Uuid) {
    let project_id = Uuid::new_v4();
    let project = Project {
      id: project_id,
      title: "Quiz".into(),
      max_students: 5,
      num_variants: 1,
      status: ProjectStatus::Ready,
      start_time: None,
      end_time: None,
      source_ref: None,
      question_types: Vec::new(),
    };
    let question = Question {
      id: Uuid::new_v4(),
      project_id,
      variant_number: 1,
      text: "2+2?".into(),
      points: 1.0,
      order: 0,
      kind: QuestionKind::SingleChoice {
        options: vec!["3".into(), "4".into()],
        correct_answer: serde_json::json!(1),
      },
    };
    let mut projects = HashMap::new();
    projects.insert(project_id, project);
    let mut questions = HashMap::new();
    questions.insert(project_id, vec![question]);
    let store = ExamStore::from_tables(projects, questions, HashMap::new());
    (AppState::from_parts(store, None, Prompts::default()), project_id)
  }

  fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerEvent> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
      out.push(frame.event);
    }
    out
  }

  #[tokio::test]
  async fn start_action_activates_lobby_and_project() {
    let (state, project_id) = seeded_state();
    let (handle, mut rx) = ClientHandle::new();
    state
      .lobbies
      .connect_teacher(project_id, Uuid::new_v4(), 5, handle.clone())
      .await;
    drain(&mut rx);

    assert!(teacher_action(&state, project_id, ClientWsMessage::StartTest, &handle).await);
    let project = state.store.project(project_id).await.expect("project");
    assert_eq!(project.status, ProjectStatus::Active);
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, ServerEvent::TestStarted { .. })));

    // starting twice only yields an error frame
    assert!(teacher_action(&state, project_id, ClientWsMessage::StartTest, &handle).await);
    let events = drain(&mut rx);
    assert!(matches!(
      &events[..],
      [ServerEvent::Error { message }] if message == "Test already started"
    ));
  }

  #[tokio::test]
  async fn close_action_ends_the_teacher_loop() {
    let (state, project_id) = seeded_state();
    let (handle, mut rx) = ClientHandle::new();
    state
      .lobbies
      .connect_teacher(project_id, Uuid::new_v4(), 5, handle.clone())
      .await;
    drain(&mut rx);

    let keep_going = teacher_action(&state, project_id, ClientWsMessage::CloseLobby, &handle).await;
    assert!(!keep_going);
    assert!(!state.lobbies.contains(project_id).await);
    let events = drain(&mut rx);
    assert!(matches!(&events[..], [ServerEvent::LobbyClosed { .. }]));
  }

  #[tokio::test]
  async fn wrong_role_actions_get_an_error_frame() {
    let (state, project_id) = seeded_state();
    let (teacher_handle, mut teacher_rx) = ClientHandle::new();
    state
      .lobbies
      .connect_teacher(project_id, Uuid::new_v4(), 5, teacher_handle.clone())
      .await;
    drain(&mut teacher_rx);

    // a student action arriving on the teacher socket
    assert!(teacher_action(&state, project_id, ClientWsMessage::Ready, &teacher_handle).await);
    let events = drain(&mut teacher_rx);
    assert!(matches!(
      &events[..],
      [ServerEvent::Error { message }] if message == "Unauthorized"
    ));

    // and a teacher action arriving on a student socket
    let (student_handle, mut student_rx) = ClientHandle::new();
    let student_id = Uuid::new_v4();
    assert!(
      student_action(&state, project_id, student_id, ClientWsMessage::StartTest, &student_handle)
        .await
    );
    let events = drain(&mut student_rx);
    assert!(matches!(
      &events[..],
      [ServerEvent::Error { message }] if message == "Unauthorized"
    ));
  }

  #[tokio::test]
  async fn leave_action_removes_the_student_and_ends_the_loop() {
    let (state, project_id) = seeded_state();
    let (teacher_handle, mut teacher_rx) = ClientHandle::new();
    state
      .lobbies
      .connect_teacher(project_id, Uuid::new_v4(), 5, teacher_handle)
      .await;

    let student_id = Uuid::new_v4();
    let presence = Presence {
      user_id: student_id,
      name: "ada".into(),
      email: "ada@example.com".into(),
      status: Readiness::Waiting,
      joined_at: Utc::now(),
    };
    let (student_handle, _student_rx) = ClientHandle::new();
    state
      .lobbies
      .connect_student(project_id, presence, student_handle.clone())
      .await
      .expect("join");
    drain(&mut teacher_rx);

    let keep_going =
      student_action(&state, project_id, student_id, ClientWsMessage::Leave, &student_handle).await;
    assert!(!keep_going);
    let events = drain(&mut teacher_rx);
    assert!(events.iter().any(|e| matches!(e, ServerEvent::StudentLeft { .. })));
  }

  #[tokio::test]
  async fn complete_action_closes_the_project_for_new_attempts() {
    let (state, project_id) = seeded_state();
    let (handle, _rx) = ClientHandle::new();
    state
      .lobbies
      .connect_teacher(project_id, Uuid::new_v4(), 5, handle.clone())
      .await;
    assert!(teacher_action(&state, project_id, ClientWsMessage::StartTest, &handle).await);
    assert!(teacher_action(&state, project_id, ClientWsMessage::CompleteTest, &handle).await);
    let project = state.store.project(project_id).await.expect("project");
    assert_eq!(project.status, ProjectStatus::Closed);
  }
}
