//! Domain models: projects, questions, attempts, answers, jobs, and lobby presence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Caller role attached to every connection/request by the identity layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    Student,
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Lifecycle of an assessment project.
/// `Ready` means questions exist and the scheduled window applies;
/// `Active` means a teacher opened it explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Ready,
    Active,
    Closed,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        ProjectStatus::Draft
    }
}

/// How many questions of one kind a generation job should produce.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionTypeConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: u32,
}

/// An assessment definition students take a timed test against.
#[derive(Clone, Debug, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub title: String,
    pub max_students: usize,
    pub num_variants: u32,
    pub status: ProjectStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Indexed source excerpt handed to the oracle; set by the indexing job.
    pub source_ref: Option<String>,
    pub question_types: Vec<QuestionTypeConfig>,
}

/// Raw source text an indexing job folds into `Project::source_ref`.
#[derive(Clone, Debug)]
pub struct Material {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub content: String,
}

/// One left/right pair of a matching question.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingPair {
    pub left: String,
    pub right: String,
}

/// Per-kind payload of a question. The tag strings are the wire names.
///
/// Answer keys are kept as JSON values where the source of the key (config
/// bank or AI generation) does not guarantee a stable primitive type; the
/// grading engine normalizes both sides before comparing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QuestionKind {
    #[serde(rename = "single-choice")]
    SingleChoice {
        options: Vec<String>,
        #[serde(rename = "correctAnswer")]
        correct_answer: Value,
    },
    #[serde(rename = "multiple-choice")]
    MultipleChoice {
        options: Vec<String>,
        #[serde(rename = "correctAnswers")]
        correct_answers: Vec<Value>,
    },
    #[serde(rename = "true-false")]
    TrueFalse {
        #[serde(rename = "correctAnswer")]
        correct_answer: Value,
    },
    #[serde(rename = "short-answer")]
    ShortAnswer {
        #[serde(rename = "expectedKeywords")]
        expected_keywords: Vec<String>,
    },
    #[serde(rename = "essay")]
    Essay {
        #[serde(default)]
        rubric: Vec<String>,
    },
    #[serde(rename = "matching")]
    Matching { pairs: Vec<MatchingPair> },
}

impl QuestionKind {
    /// Wire tag of this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            QuestionKind::SingleChoice { .. } => "single-choice",
            QuestionKind::MultipleChoice { .. } => "multiple-choice",
            QuestionKind::TrueFalse { .. } => "true-false",
            QuestionKind::ShortAnswer { .. } => "short-answer",
            QuestionKind::Essay { .. } => "essay",
            QuestionKind::Matching { .. } => "matching",
        }
    }

    /// Kinds that need semantic judgment and go through the async grading path.
    pub fn is_open_ended(&self) -> bool {
        matches!(
            self,
            QuestionKind::ShortAnswer { .. }
                | QuestionKind::Essay { .. }
                | QuestionKind::Matching { .. }
        )
    }
}

/// A question pinned to one variant of a project.
/// Immutable once attempts exist against its variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub project_id: Uuid,
    pub variant_number: u32,
    pub text: String,
    pub points: f64,
    pub order: u32,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

/// Attempt lifecycle. Moves strictly forward; only the async grading path
/// performs the final completed -> graded transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptStatus {
    Pending,
    InProgress,
    Completed,
    Graded,
}

impl AttemptStatus {
    pub fn is_terminal_for_begin(&self) -> bool {
        matches!(self, AttemptStatus::Completed | AttemptStatus::Graded)
    }
}

/// One student's run against one project. At most one non-terminal attempt
/// exists per (project, student).
#[derive(Clone, Debug, Serialize)]
pub struct TestAttempt {
    pub id: Uuid,
    pub project_id: Uuid,
    pub student_id: Uuid,
    pub variant_number: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub score: f64,
    pub max_score: f64,
}

/// Grading state of a single answer. Note the separate spelling from
/// `AttemptStatus`: answers use snake_case on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Who produced the score on an answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradedBy {
    System,
    Ai,
    PendingManualReview,
}

/// A student's answer to one question of their attempt.
#[derive(Clone, Debug, Serialize)]
pub struct AnswerRecord {
    pub attempt_id: Uuid,
    pub question_id: Uuid,
    pub answer: Value,
    pub is_correct: Option<bool>,
    pub score: f64,
    pub feedback: Option<String>,
    pub grading_status: GradingStatus,
    /// Set once a grader has settled the answer.
    pub graded_by: Option<GradedBy>,
    pub answered_at: DateTime<Utc>,
}

/// Long-running work tracked for polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Indexing,
    Generation,
    Grading,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Indexing => "indexing",
            JobKind::Generation => "generation",
            JobKind::Grading => "grading",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indexing" => Ok(JobKind::Indexing),
            "generation" => Ok(JobKind::Generation),
            "grading" => Ok(JobKind::Grading),
            other => Err(format!("unknown job kind: {}", other)),
        }
    }
}

/// Job status. `Partial` means the job finished but some items failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Partial,
}

impl JobStatus {
    /// Pending and processing jobs block a new enqueue for the same key.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

/// One background job record. Exactly one active job per (target, kind).
#[derive(Clone, Debug, Serialize)]
pub struct BackgroundJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub target_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub items_total: usize,
    pub items_failed: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Readiness flag of a student waiting in a lobby.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Waiting,
    Ready,
}

/// Lobby lifecycle; moves forward only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyStatus {
    Waiting,
    Active,
    Completed,
}

/// A student currently connected to a lobby, as shown to everyone in it.
#[derive(Clone, Debug, Serialize)]
pub struct Presence {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub status: Readiness,
    pub joined_at: DateTime<Utc>,
}
