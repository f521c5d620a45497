//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.
//!
//! The lobby protocol uses snake_case payload keys; the attempt/job HTTP API
//! uses camelCase, matching what the frontend consumes.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{
    AnswerRecord, AttemptStatus, BackgroundJob, GradingStatus, JobKind, JobStatus, LobbyStatus,
    Presence, Question, QuestionKind, Readiness, Role, TestAttempt,
};

/// Pre-validated identity attached to a connection or request.
/// The identity layer in front of us is trusted; we only read it.
#[derive(Clone, Debug, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// Messages a connected client can send over the lobby socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientWsMessage {
    // student actions
    Ready,
    NotReady,
    Leave,
    // teacher actions
    StartTest,
    KickStudent { user_id: Uuid },
    CompleteTest,
    CloseLobby,
    // either role
    Ping,
}

/// Event payloads the server broadcasts; `type` + `data` on the wire.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    LobbyUpdate(LobbySnapshot),
    StudentJoined(Presence),
    StudentLeft { user_id: Uuid, name: String },
    StudentReady { user_id: Uuid, status: Readiness },
    TestStarted { project_id: Uuid, started_at: DateTime<Utc> },
    TestCompleted { project_id: Uuid },
    LobbyClosed { project_id: Uuid, reason: String },
    Error { message: String },
    Pong {},
}

/// Wire frame: one event plus the server-side timestamp.
#[derive(Clone, Debug, Serialize)]
pub struct ServerFrame {
    #[serde(flatten)]
    pub event: ServerEvent,
    pub timestamp: DateTime<Utc>,
}

impl ServerFrame {
    pub fn now(event: ServerEvent) -> Self {
        Self { event, timestamp: Utc::now() }
    }
}

/// Full lobby state, sent to everyone on every membership/readiness change.
#[derive(Clone, Debug, Serialize)]
pub struct LobbySnapshot {
    pub project_id: Uuid,
    pub status: LobbyStatus,
    pub students: Vec<Presence>,
    pub student_count: usize,
    pub max_students: usize,
}

//
// HTTP request/response DTOs
//

/// Question as delivered to a student: answer key stripped. Matching
/// questions expose the left items plus a shuffled right column.
#[derive(Clone, Debug, Serialize)]
pub struct QuestionForStudent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
    pub points: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matching: Option<MatchingBoard>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MatchingBoard {
    pub left: Vec<String>,
    pub right: Vec<String>,
}

/// Strip the answer key from a question for delivery to a student.
pub fn question_for_student(q: &Question) -> QuestionForStudent {
    let (options, matching) = match &q.kind {
        QuestionKind::SingleChoice { options, .. }
        | QuestionKind::MultipleChoice { options, .. } => (Some(options.clone()), None),
        QuestionKind::Matching { pairs } => {
            let left: Vec<String> = pairs.iter().map(|p| p.left.clone()).collect();
            let mut right: Vec<String> = pairs.iter().map(|p| p.right.clone()).collect();
            right.shuffle(&mut rand::thread_rng());
            (None, Some(MatchingBoard { left, right }))
        }
        _ => (None, None),
    };
    QuestionForStudent {
        id: q.id,
        kind: q.kind.tag(),
        text: q.text.clone(),
        points: q.points,
        options,
        matching,
    }
}

/// The answer key of a question, revealed only in the results view.
pub fn answer_key(q: &Question) -> Value {
    match &q.kind {
        QuestionKind::SingleChoice { correct_answer, .. } => correct_answer.clone(),
        QuestionKind::MultipleChoice { correct_answers, .. } => Value::Array(correct_answers.clone()),
        QuestionKind::TrueFalse { correct_answer } => correct_answer.clone(),
        QuestionKind::ShortAnswer { expected_keywords } => serde_json::json!(expected_keywords),
        QuestionKind::Essay { rubric } => serde_json::json!(rubric),
        QuestionKind::Matching { pairs } => serde_json::json!(pairs),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOut {
    pub question_id: Uuid,
    pub answer: Value,
    pub is_correct: Option<bool>,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub grading_status: GradingStatus,
}

pub fn answer_out(a: &AnswerRecord) -> AnswerOut {
    AnswerOut {
        question_id: a.question_id,
        answer: a.answer.clone(),
        is_correct: a.is_correct,
        score: a.score,
        feedback: a.feedback.clone(),
        grading_status: a.grading_status,
    }
}

/// Attempt view for the owning student.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptOut {
    pub id: Uuid,
    pub project_id: Uuid,
    pub status: AttemptStatus,
    pub variant_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub score: f64,
    pub max_score: f64,
    pub questions: Vec<QuestionForStudent>,
    pub answers: Vec<AnswerOut>,
}

pub fn attempt_out(t: &TestAttempt, questions: &[Question], answers: &[AnswerRecord]) -> AttemptOut {
    AttemptOut {
        id: t.id,
        project_id: t.project_id,
        status: t.status,
        variant_number: t.variant_number,
        started_at: t.started_at,
        completed_at: t.completed_at,
        score: t.score,
        max_score: t.max_score,
        questions: questions.iter().map(question_for_student).collect(),
        answers: answers.iter().map(answer_out).collect(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerIn {
    pub question_id: Uuid,
    pub answer: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerAck {
    pub question_id: Uuid,
    pub answer: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeOut {
    pub attempt_id: Uuid,
    pub score: f64,
    pub max_score: f64,
    pub correct_count: usize,
    pub total_questions: usize,
    pub passed: bool,
}

/// Per-question breakdown in the results view; correct answers revealed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionResult {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
    pub points: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub correct_answer: Value,
    pub student_answer: Option<Value>,
    pub is_correct: Option<bool>,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub grading_status: Option<GradingStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsOut {
    pub id: Uuid,
    pub project_id: Uuid,
    pub project_title: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub score: f64,
    pub max_score: f64,
    pub passed: bool,
    pub questions: Vec<QuestionResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnqueueIn {
    pub kind: JobKind,
    pub target_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOut {
    pub id: Uuid,
    pub kind: JobKind,
    pub target_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub items_total: usize,
    pub items_failed: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub fn job_out(j: &BackgroundJob) -> JobOut {
    JobOut {
        id: j.id,
        kind: j.kind,
        target_id: j.target_id,
        status: j.status,
        progress: j.progress,
        error: j.error.clone(),
        items_total: j.items_total,
        items_failed: j.items_failed,
        created_at: j.created_at,
        updated_at: j.updated_at,
    }
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
}
