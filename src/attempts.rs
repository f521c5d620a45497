//! Attempt lifecycle: access window, begin/resume, answer saving and
//! finalize. Thin service layer over the store; open-ended answers are
//! handed to the background grading job at finalize.

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{AttemptStatus, JobKind, Project, ProjectStatus};
use crate::error::AppError;
use crate::protocol::{
    answer_key, attempt_out, question_for_student, AnswerAck, AnswerIn, AttemptOut, FinalizeOut,
    QuestionResult, ResultsOut,
};
use crate::state::AppState;

/// Is this project currently open for starting an attempt?
///
/// Active projects run until their end time. Ready projects open once
/// their scheduled start passes (no start time means open immediately).
fn check_access_window(project: &Project) -> Result<(), AppError> {
    let now = Utc::now();
    match project.status {
        ProjectStatus::Active => {
            if project.end_time.is_some_and(|end| end < now) {
                return Err(AppError::validation("This test has ended"));
            }
        }
        ProjectStatus::Ready => {
            if project.start_time.is_some_and(|start| start > now) {
                return Err(AppError::validation("This test has not started yet"));
            }
            if project.end_time.is_some_and(|end| end < now) {
                return Err(AppError::validation("This test has ended"));
            }
        }
        _ => {
            return Err(AppError::validation("This test is not currently available"));
        }
    }
    Ok(())
}

/// Start a new attempt, or resume the student's in-progress one.
#[instrument(level = "debug", skip(state))]
pub async fn begin_attempt(
    state: &AppState,
    project_id: Uuid,
    student_id: Uuid,
) -> Result<AttemptOut, AppError> {
    let project = state.store.project(project_id).await?;
    check_access_window(&project)?;
    let outcome = state.store.create_or_get_attempt(&project, student_id).await?;
    let attempt = outcome.attempt();
    let questions = state
        .store
        .questions_for_variant(project.id, attempt.variant_number)
        .await;
    let answers = state.store.answers_for(attempt.id).await;
    Ok(attempt_out(attempt, &questions, &answers))
}

pub async fn submit_answer(
    state: &AppState,
    attempt_id: Uuid,
    student_id: Uuid,
    input: AnswerIn,
) -> Result<AnswerAck, AppError> {
    let record = state
        .store
        .save_answer(attempt_id, student_id, input.question_id, input.answer)
        .await?;
    Ok(AnswerAck { question_id: record.question_id, answer: record.answer })
}

/// Close the attempt: objective answers are scored now, open-ended ones
/// go to a background grading job.
#[instrument(level = "debug", skip(state))]
pub async fn finalize(
    state: &AppState,
    attempt_id: Uuid,
    student_id: Uuid,
) -> Result<FinalizeOut, AppError> {
    let summary = state.store.finalize_attempt(attempt_id, student_id).await?;
    if summary.pending_open > 0 {
        // the attempt is already committed; an active grading job for it
        // will settle these answers
        match state.jobs.enqueue(JobKind::Grading, attempt_id).await {
            Ok(job) => info!(
                target: "attempt",
                %attempt_id, job_id = %job.id, pending = summary.pending_open,
                "grading job enqueued"
            ),
            Err(AppError::Conflict(reason)) => warn!(
                target: "attempt",
                %attempt_id, %reason, "grading job already active"
            ),
            Err(e) => return Err(e),
        }
    }
    Ok(FinalizeOut {
        attempt_id,
        score: summary.attempt.score,
        max_score: summary.attempt.max_score,
        correct_count: summary.correct_count,
        total_questions: summary.total_questions,
        passed: summary.passed,
    })
}

/// Current attempt view for its owner; score is provisional until the
/// attempt reaches graded.
pub async fn attempt_view(
    state: &AppState,
    attempt_id: Uuid,
    student_id: Uuid,
) -> Result<AttemptOut, AppError> {
    let attempt = state.store.attempt_owned(attempt_id, student_id).await?;
    let questions = state
        .store
        .questions_for_variant(attempt.project_id, attempt.variant_number)
        .await;
    let answers = state.store.answers_for(attempt.id).await;
    Ok(attempt_out(&attempt, &questions, &answers))
}

/// Per-question breakdown with correct answers revealed. Only available
/// once the attempt is out of in-progress, so keys cannot leak early.
pub async fn results(
    state: &AppState,
    attempt_id: Uuid,
    student_id: Uuid,
) -> Result<ResultsOut, AppError> {
    let attempt = state.store.attempt_owned(attempt_id, student_id).await?;
    if attempt.status == AttemptStatus::InProgress {
        return Err(AppError::conflict("Test is not completed yet"));
    }
    let project = state.store.project(attempt.project_id).await?;
    let questions = state
        .store
        .questions_for_variant(attempt.project_id, attempt.variant_number)
        .await;
    let answers = state.store.answers_for(attempt.id).await;

    let breakdown: Vec<QuestionResult> = questions
        .iter()
        .map(|q| {
            let answered = answers.iter().find(|a| a.question_id == q.id);
            let view = question_for_student(q);
            QuestionResult {
                id: q.id,
                kind: q.kind.tag(),
                text: q.text.clone(),
                points: q.points,
                options: view.options,
                correct_answer: answer_key(q),
                student_answer: answered.map(|a| a.answer.clone()),
                is_correct: answered.map(|a| a.is_correct.unwrap_or(false)),
                score: answered.map(|a| a.score).unwrap_or(0.0),
                feedback: answered.and_then(|a| a.feedback.clone()),
                grading_status: answered.map(|a| a.grading_status),
            }
        })
        .collect();

    let passed =
        attempt.max_score > 0.0 && attempt.score >= attempt.max_score * 0.6;
    Ok(ResultsOut {
        id: attempt.id,
        project_id: attempt.project_id,
        project_title: project.title,
        status: attempt.status,
        started_at: attempt.started_at,
        completed_at: attempt.completed_at,
        score: attempt.score,
        max_score: attempt.max_score,
        passed,
        questions: breakdown,
    })
}
