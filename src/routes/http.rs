//! HTTP endpoint handlers. Thin wrappers: read the identity headers, forward
//! to the attempt and job services, serialize the result.

use std::sync::Arc;
use axum::{
  extract::{Path, State},
  http::HeaderMap,
  Json,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::attempts;
use crate::domain::{JobKind, Role};
use crate::error::AppError;
use crate::protocol::*;
use crate::state::AppState;

/// The identity layer in front of us is trusted; these headers are its word.
fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, AppError> {
  let user_id = headers
    .get("x-user-id")
    .and_then(|v| v.to_str().ok())
    .and_then(|s| Uuid::parse_str(s).ok())
    .ok_or_else(|| AppError::validation("Missing or invalid x-user-id header"))?;
  let role = headers
    .get("x-user-role")
    .and_then(|v| v.to_str().ok())
    .and_then(|s| s.parse::<Role>().ok())
    .ok_or_else(|| AppError::validation("Missing or invalid x-user-role header"))?;
  Ok(Identity { user_id, role, name: String::new(), email: String::new() })
}

fn require(who: &Identity, role: Role) -> Result<(), AppError> {
  if who.role == role {
    Ok(())
  } else {
    Err(AppError::validation("Unauthorized"))
  }
}

#[instrument(level = "info")]
pub async fn http_health() -> Json<HealthOut> {
  Json(HealthOut { ok: true })
}

#[instrument(level = "info", skip(state, headers))]
pub async fn http_begin_attempt(
  State(state): State<Arc<AppState>>,
  Path(project_id): Path<Uuid>,
  headers: HeaderMap,
) -> Result<Json<AttemptOut>, AppError> {
  let who = identity_from_headers(&headers)?;
  require(&who, Role::Student)?;
  let out = attempts::begin_attempt(&state, project_id, who.user_id).await?;
  info!(target: "attempt", %project_id, student_id = %who.user_id, attempt_id = %out.id, variant = out.variant_number, "HTTP begin served");
  Ok(Json(out))
}

#[instrument(level = "info", skip(state, headers))]
pub async fn http_get_attempt(
  State(state): State<Arc<AppState>>,
  Path(attempt_id): Path<Uuid>,
  headers: HeaderMap,
) -> Result<Json<AttemptOut>, AppError> {
  let who = identity_from_headers(&headers)?;
  require(&who, Role::Student)?;
  let out = attempts::attempt_view(&state, attempt_id, who.user_id).await?;
  Ok(Json(out))
}

#[instrument(level = "info", skip(state, headers, body), fields(question_id = %body.question_id))]
pub async fn http_save_answer(
  State(state): State<Arc<AppState>>,
  Path(attempt_id): Path<Uuid>,
  headers: HeaderMap,
  Json(body): Json<AnswerIn>,
) -> Result<Json<AnswerAck>, AppError> {
  let who = identity_from_headers(&headers)?;
  require(&who, Role::Student)?;
  let ack = attempts::submit_answer(&state, attempt_id, who.user_id, body).await?;
  info!(target: "attempt", %attempt_id, question_id = %ack.question_id, "HTTP answer saved");
  Ok(Json(ack))
}

#[instrument(level = "info", skip(state, headers))]
pub async fn http_finalize_attempt(
  State(state): State<Arc<AppState>>,
  Path(attempt_id): Path<Uuid>,
  headers: HeaderMap,
) -> Result<Json<FinalizeOut>, AppError> {
  let who = identity_from_headers(&headers)?;
  require(&who, Role::Student)?;
  let out = attempts::finalize(&state, attempt_id, who.user_id).await?;
  info!(
    target: "attempt",
    %attempt_id,
    score = out.score, max_score = out.max_score, passed = out.passed,
    "HTTP finalize served"
  );
  Ok(Json(out))
}

#[instrument(level = "info", skip(state, headers))]
pub async fn http_get_results(
  State(state): State<Arc<AppState>>,
  Path(attempt_id): Path<Uuid>,
  headers: HeaderMap,
) -> Result<Json<ResultsOut>, AppError> {
  let who = identity_from_headers(&headers)?;
  require(&who, Role::Student)?;
  let out = attempts::results(&state, attempt_id, who.user_id).await?;
  Ok(Json(out))
}

#[instrument(level = "info", skip(state, headers, body), fields(kind = body.kind.as_str(), target_id = %body.target_id))]
pub async fn http_enqueue_job(
  State(state): State<Arc<AppState>>,
  headers: HeaderMap,
  Json(body): Json<JobEnqueueIn>,
) -> Result<Json<JobOut>, AppError> {
  let who = identity_from_headers(&headers)?;
  require(&who, Role::Teacher)?;
  let job = state.jobs.enqueue(body.kind, body.target_id).await?;
  info!(target: "jobs", job_id = %job.id, kind = job.kind.as_str(), target_id = %job.target_id, "HTTP job enqueued");
  Ok(Json(job_out(&job)))
}

#[instrument(level = "info", skip(state, headers))]
pub async fn http_get_job(
  State(state): State<Arc<AppState>>,
  Path((kind, target_id)): Path<(String, Uuid)>,
  headers: HeaderMap,
) -> Result<Json<JobOut>, AppError> {
  identity_from_headers(&headers)?;
  let kind = kind.parse::<JobKind>().map_err(AppError::validation)?;
  let job = state.jobs.poll(kind, target_id).await?;
  Ok(Json(job_out(&job)))
}
