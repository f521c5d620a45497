//! Background job tracker: indexing, generation and grading work that
//! outlives a request. One active job per (kind, target); callers poll
//! for progress, nothing is pushed.
//!
//! A single item failing marks that item and moves on; the job ends
//! Partial when some items survived and Failed when none did.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Prompts;
use crate::domain::{
    AttemptStatus, BackgroundJob, GradedBy, GradingStatus, JobKind, JobStatus, ProjectStatus,
    Question, QuestionKind,
};
use crate::error::AppError;
use crate::grading;
use crate::oracle::Oracle;
use crate::store::ExamStore;

/// Hard cap on one job run; items past it are failed, never left pending.
const JOB_TIME_LIMIT: Duration = Duration::from_secs(600);

/// Item counts a job run reports back to the driver.
struct JobReport {
    total: usize,
    failed: usize,
}

#[derive(Default)]
struct JobTable {
    by_id: HashMap<Uuid, BackgroundJob>,
    /// Latest job per (kind, target); the poll key.
    latest: HashMap<(JobKind, Uuid), Uuid>,
}

/// Grade settled for one open-ended answer.
struct Settled {
    score: f64,
    is_correct: bool,
    feedback: String,
    graded_by: GradedBy,
}

fn no_answer() -> Settled {
    Settled {
        score: 0.0,
        is_correct: false,
        feedback: "No answer provided.".into(),
        graded_by: GradedBy::System,
    }
}

fn answer_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Tracker plus the worker pool jobs run on.
#[derive(Clone)]
pub struct JobTracker {
    store: ExamStore,
    oracle: Option<Oracle>,
    prompts: Arc<Prompts>,
    jobs: Arc<RwLock<JobTable>>,
    pool: Arc<Semaphore>,
}

impl JobTracker {
    pub fn new(
        store: ExamStore,
        oracle: Option<Oracle>,
        prompts: Arc<Prompts>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            oracle,
            prompts,
            jobs: Arc::new(RwLock::new(JobTable::default())),
            pool: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Record a job and hand it to the worker pool. Fails if an active
    /// job already exists for this (kind, target).
    #[instrument(level = "debug", skip(self))]
    pub async fn enqueue(&self, kind: JobKind, target_id: Uuid) -> Result<BackgroundJob, AppError> {
        // target must exist before we commit to a job for it
        match kind {
            JobKind::Grading => {
                // grading only makes sense on a closed attempt
                let attempt = self.store.attempt(target_id).await?;
                if attempt.status != AttemptStatus::Completed {
                    return Err(AppError::conflict("Test is not completed yet"));
                }
            }
            JobKind::Generation | JobKind::Indexing => {
                self.store.project(target_id).await?;
            }
        }

        let job = {
            let mut table = self.jobs.write().await;
            if let Some(active) = table
                .latest
                .get(&(kind, target_id))
                .and_then(|id| table.by_id.get(id))
                .filter(|j| j.status.is_active())
            {
                return Err(AppError::conflict(format!(
                    "A {} job is already running for this target",
                    active.kind.as_str()
                )));
            }
            let now = Utc::now();
            let job = BackgroundJob {
                id: Uuid::new_v4(),
                kind,
                target_id,
                status: JobStatus::Pending,
                progress: 0,
                error: None,
                items_total: 0,
                items_failed: 0,
                created_at: now,
                updated_at: now,
            };
            table.latest.insert((kind, target_id), job.id);
            table.by_id.insert(job.id, job.clone());
            job
        };
        info!(target: "jobs", job_id = %job.id, kind = kind.as_str(), %target_id, "job enqueued");
        self.spawn_worker(job.id, kind, target_id);
        Ok(job)
    }

    /// Latest job snapshot for a (kind, target).
    pub async fn poll(&self, kind: JobKind, target_id: Uuid) -> Result<BackgroundJob, AppError> {
        let table = self.jobs.read().await;
        table
            .latest
            .get(&(kind, target_id))
            .and_then(|id| table.by_id.get(id))
            .cloned()
            .ok_or_else(|| AppError::not_found("job", target_id))
    }

    async fn update<F>(&self, job_id: Uuid, apply: F)
    where
        F: FnOnce(&mut BackgroundJob),
    {
        let mut table = self.jobs.write().await;
        if let Some(job) = table.by_id.get_mut(&job_id) {
            apply(job);
            job.updated_at = Utc::now();
        }
    }

    fn spawn_worker(&self, job_id: Uuid, kind: JobKind, target_id: Uuid) {
        let tracker = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = tracker.pool.clone().acquire_owned().await else {
                // pool closed, the process is going down
                return;
            };
            tracker
                .update(job_id, |j| j.status = JobStatus::Processing)
                .await;
            let started = std::time::Instant::now();
            let run = match kind {
                JobKind::Grading => tracker.run_grading(job_id, target_id).await,
                JobKind::Generation => tracker.run_generation(job_id, target_id).await,
                JobKind::Indexing => tracker.run_indexing(job_id, target_id).await,
            };
            let outcome = match run {
                Ok(report) => {
                    let status = if report.failed == 0 {
                        JobStatus::Completed
                    } else if report.failed == report.total {
                        JobStatus::Failed
                    } else {
                        JobStatus::Partial
                    };
                    let error = (report.failed > 0)
                        .then(|| format!("{} of {} items failed", report.failed, report.total));
                    (status, error)
                }
                Err(e) => (JobStatus::Failed, Some(e.to_string())),
            };
            let (status, error) = outcome;
            tracker
                .update(job_id, |j| {
                    j.status = status;
                    j.error = error.clone();
                    if status == JobStatus::Completed {
                        j.progress = 100;
                    }
                })
                .await;
            info!(
                target: "jobs",
                %job_id, kind = kind.as_str(), %target_id, ?status,
                elapsed = ?started.elapsed(),
                "job finished"
            );
        });
    }

    /// Run one job body under the global time limit.
    async fn run_grading(&self, job_id: Uuid, attempt_id: Uuid) -> Result<JobReport, AppError> {
        match tokio::time::timeout(JOB_TIME_LIMIT, self.grade_attempt(job_id, attempt_id)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Internal("job timed out".into())),
        }
    }

    async fn run_generation(&self, job_id: Uuid, project_id: Uuid) -> Result<JobReport, AppError> {
        match tokio::time::timeout(JOB_TIME_LIMIT, self.generate_project(job_id, project_id)).await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Internal("job timed out".into())),
        }
    }

    async fn run_indexing(&self, job_id: Uuid, project_id: Uuid) -> Result<JobReport, AppError> {
        match tokio::time::timeout(JOB_TIME_LIMIT, self.index_project(job_id, project_id)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Internal("job timed out".into())),
        }
    }

    //
    // Grading
    //

    async fn grade_attempt(&self, job_id: Uuid, attempt_id: Uuid) -> Result<JobReport, AppError> {
        let attempt = self.store.attempt(attempt_id).await?;
        let project = self.store.project(attempt.project_id).await?;
        let open = self.store.open_ended_answers(attempt_id).await?;
        let total = open.len();
        self.update(job_id, |j| j.items_total = total).await;

        let mut failed = 0usize;
        for (i, (question, record)) in open.iter().enumerate() {
            self.update(job_id, |j| j.progress = ((i * 100) / total.max(1)) as u8)
                .await;
            if let Err(e) = self
                .store
                .update_answer(attempt_id, question.id, |r| {
                    r.grading_status = GradingStatus::InProgress;
                })
                .await
            {
                warn!(target: "jobs", question_id = %question.id, error = %e, "answer vanished before grading");
                failed += 1;
                self.update(job_id, |j| j.items_failed = failed).await;
                continue;
            }

            match self
                .settle_answer(question, &record.answer, project.source_ref.as_deref())
                .await
            {
                Ok(settled) => {
                    self.store
                        .update_answer(attempt_id, question.id, |r| {
                            r.score = settled.score;
                            r.is_correct = Some(settled.is_correct);
                            r.feedback =
                                (!settled.feedback.is_empty()).then(|| settled.feedback.clone());
                            r.grading_status = GradingStatus::Completed;
                            r.graded_by = Some(settled.graded_by);
                        })
                        .await?;
                }
                Err(e) => {
                    warn!(target: "jobs", question_id = %question.id, error = %e, "grading an answer failed");
                    failed += 1;
                    self.update(job_id, |j| j.items_failed = failed).await;
                    self.store
                        .update_answer(attempt_id, question.id, |r| {
                            r.grading_status = GradingStatus::Failed;
                            r.graded_by = Some(GradedBy::PendingManualReview);
                            r.feedback = Some(format!("Auto-grading failed: {e}"));
                        })
                        .await?;
                }
            }
        }

        self.update(job_id, |j| j.progress = 100).await;
        let updated = self.store.recompute_attempt_score(attempt_id).await?;
        info!(
            target: "jobs",
            %attempt_id, score = updated.score, status = ?updated.status,
            graded = total - failed, failed,
            "attempt grading finished"
        );
        Ok(JobReport { total, failed })
    }

    /// Settle one open-ended answer: matching deterministically, essays
    /// and short answers through the oracle with one retry.
    async fn settle_answer(
        &self,
        question: &Question,
        answer: &Value,
        source: Option<&str>,
    ) -> Result<Settled, AppError> {
        if let QuestionKind::Matching { pairs } = &question.kind {
            let submitted = grading::matching_answer_map(answer);
            if submitted.is_empty() {
                return Ok(no_answer());
            }
            let verdict = grading::grade_matching_pairs(pairs, &submitted, question.points);
            return Ok(Settled {
                score: verdict.score,
                is_correct: verdict.percentage >= 60.0,
                feedback: verdict.feedback,
                graded_by: GradedBy::System,
            });
        }

        let text = answer_text(answer);
        if text.trim().is_empty() {
            return Ok(no_answer());
        }
        let oracle = self
            .oracle
            .as_ref()
            .ok_or_else(|| AppError::OracleTransient("not configured".into()))?;
        let first = oracle
            .grade_open_answer(&self.prompts, question, &text, source)
            .await;
        let graded = match first {
            Err(AppError::OracleTransient(reason)) => {
                warn!(target: "jobs", question_id = %question.id, %reason, "oracle call failed, retrying once");
                oracle
                    .grade_open_answer(&self.prompts, question, &text, source)
                    .await
            }
            other => other,
        }?;
        Ok(Settled {
            score: graded.score,
            is_correct: graded.percentage >= 60.0,
            feedback: graded.feedback,
            graded_by: GradedBy::Ai,
        })
    }

    //
    // Generation
    //

    async fn generate_project(&self, job_id: Uuid, project_id: Uuid) -> Result<JobReport, AppError> {
        let project = self.store.project(project_id).await?;
        let source = project
            .source_ref
            .clone()
            .ok_or_else(|| AppError::validation("Project materials are not indexed yet"))?;
        if project.question_types.is_empty() {
            return Err(AppError::validation(
                "Project has no question type configuration",
            ));
        }
        let oracle = self
            .oracle
            .as_ref()
            .ok_or_else(|| AppError::OracleTransient("not configured".into()))?;

        let total = project.num_variants.max(1) as usize;
        self.update(job_id, |j| j.items_total = total).await;
        let mut failed = 0usize;
        for variant in 1..=total as u32 {
            self.update(job_id, |j| {
                j.progress = (((variant as usize - 1) * 100) / total) as u8;
            })
            .await;
            let hint = format!("{} (Variant {})", project.title, variant);
            let first = oracle
                .generate_questions(
                    &self.prompts,
                    project_id,
                    variant,
                    &source,
                    &hint,
                    &project.question_types,
                )
                .await;
            let generated = match first {
                Err(AppError::OracleTransient(reason)) => {
                    warn!(target: "jobs", variant, %reason, "generation call failed, retrying once");
                    oracle
                        .generate_questions(
                            &self.prompts,
                            project_id,
                            variant,
                            &source,
                            &hint,
                            &project.question_types,
                        )
                        .await
                }
                other => other,
            };
            match generated {
                Ok(questions) if !questions.is_empty() => {
                    self.store
                        .replace_questions(project_id, variant, questions)
                        .await?;
                }
                Ok(_) => {
                    warn!(target: "jobs", variant, "variant came back without valid questions");
                    failed += 1;
                    self.update(job_id, |j| j.items_failed = failed).await;
                }
                Err(e) => {
                    warn!(target: "jobs", variant, error = %e, "variant generation failed");
                    failed += 1;
                    self.update(job_id, |j| j.items_failed = failed).await;
                }
            }
        }

        if failed < total {
            self.store
                .set_project_status(project_id, ProjectStatus::Ready)
                .await?;
        }
        self.update(job_id, |j| j.progress = 100).await;
        Ok(JobReport { total, failed })
    }

    //
    // Indexing
    //

    async fn index_project(&self, job_id: Uuid, project_id: Uuid) -> Result<JobReport, AppError> {
        let materials = self.store.materials_for(project_id).await;
        let total = materials.len();
        if total == 0 {
            return Err(AppError::validation("Project has no materials to index"));
        }
        self.update(job_id, |j| j.items_total = total).await;

        let mut excerpt = String::new();
        let mut failed = 0usize;
        for (i, material) in materials.iter().enumerate() {
            self.update(job_id, |j| j.progress = ((i * 100) / total) as u8)
                .await;
            if material.content.trim().is_empty() {
                warn!(target: "jobs", material_id = %material.id, title = %material.title, "empty material skipped");
                failed += 1;
                self.update(job_id, |j| j.items_failed = failed).await;
                continue;
            }
            excerpt.push_str("## ");
            excerpt.push_str(&material.title);
            excerpt.push('\n');
            excerpt.push_str(material.content.trim());
            excerpt.push_str("\n\n");
        }

        if failed < total {
            self.store
                .set_source_ref(project_id, excerpt.trim().to_string())
                .await?;
        }
        self.update(job_id, |j| j.progress = 100).await;
        Ok(JobReport { total, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Material, MatchingPair, Project};
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    fn project() -> Project {
        Project {
            id: Uuid::new_v4(),
            title: "Jobs".into(),
            max_students: 30,
            num_variants: 1,
            status: ProjectStatus::Active,
            start_time: None,
            end_time: None,
            source_ref: None,
            question_types: Vec::new(),
        }
    }

    fn question(project_id: Uuid, points: f64, kind: QuestionKind) -> Question {
        Question {
            id: Uuid::new_v4(),
            project_id,
            variant_number: 1,
            text: "q".into(),
            points,
            order: 0,
            kind,
        }
    }

    fn store_with(project: &Project, questions: Vec<Question>, materials: Vec<Material>) -> ExamStore {
        let mut projects = StdHashMap::new();
        projects.insert(project.id, project.clone());
        let mut by_project: StdHashMap<Uuid, Vec<Question>> = StdHashMap::new();
        for q in questions {
            by_project.entry(q.project_id).or_default().push(q);
        }
        let mut mats: StdHashMap<Uuid, Vec<Material>> = StdHashMap::new();
        for m in materials {
            mats.entry(m.project_id).or_default().push(m);
        }
        ExamStore::from_tables(projects, by_project, mats)
    }

    fn tracker(store: ExamStore, workers: usize) -> JobTracker {
        JobTracker::new(store, None, Arc::new(Prompts::default()), workers)
    }

    async fn wait_done(t: &JobTracker, kind: JobKind, target: Uuid) -> BackgroundJob {
        for _ in 0..400 {
            let job = t.poll(kind, target).await.expect("job exists");
            if !job.status.is_active() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never finished");
    }

    #[tokio::test]
    async fn enqueue_refuses_a_second_active_job_for_the_same_target() {
        let p = project();
        let material = Material {
            id: Uuid::new_v4(),
            project_id: p.id,
            title: "notes".into(),
            content: "text".into(),
        };
        let store = store_with(&p, Vec::new(), vec![material]);
        // zero workers: the first job stays pending forever
        let t = tracker(store, 0);

        t.enqueue(JobKind::Indexing, p.id).await.expect("first");
        let err = t
            .enqueue(JobKind::Indexing, p.id)
            .await
            .expect_err("still active");
        assert!(matches!(err, AppError::Conflict(_)));

        // a different kind for the same target is fine
        t.enqueue(JobKind::Generation, p.id).await.expect("other kind");
    }

    #[tokio::test]
    async fn enqueue_validates_the_target() {
        let t = tracker(ExamStore::new(), 1);
        let err = t
            .enqueue(JobKind::Grading, Uuid::new_v4())
            .await
            .expect_err("no attempt");
        assert!(matches!(err, AppError::NotFound(_)));
        let err = t.poll(JobKind::Grading, Uuid::new_v4()).await.expect_err("no job");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn grading_jobs_require_a_finalized_attempt() {
        let p = project();
        let essay = question(p.id, 5.0, QuestionKind::Essay { rubric: vec![] });
        let store = store_with(&p, vec![essay.clone()], Vec::new());
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();
        store.save_answer(attempt.id, student, essay.id, json!("draft")).await.expect("save");

        let t = tracker(store.clone(), 1);
        let err = t
            .enqueue(JobKind::Grading, attempt.id)
            .await
            .expect_err("attempt still open");
        assert_eq!(err.to_string(), "Test is not completed yet");
        assert!(t.poll(JobKind::Grading, attempt.id).await.is_err());

        // the open attempt was left untouched
        let untouched = store.attempt(attempt.id).await.expect("attempt");
        assert_eq!(untouched.status, AttemptStatus::InProgress);
        assert_eq!(untouched.score, 0.0);

        store.finalize_attempt(attempt.id, student).await.expect("finalize");
        t.enqueue(JobKind::Grading, attempt.id).await.expect("now allowed");
    }

    #[tokio::test]
    async fn grading_without_an_oracle_demotes_essays_to_manual_review() {
        let p = project();
        let choice = question(
            p.id,
            2.0,
            QuestionKind::SingleChoice {
                options: vec!["a".into(), "b".into()],
                correct_answer: json!(0),
            },
        );
        let essay = question(p.id, 8.0, QuestionKind::Essay { rubric: vec![] });
        let store = store_with(&p, vec![choice.clone(), essay.clone()], Vec::new());
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();
        store.save_answer(attempt.id, student, choice.id, json!(0)).await.expect("save");
        store.save_answer(attempt.id, student, essay.id, json!("long text")).await.expect("save");
        store.finalize_attempt(attempt.id, student).await.expect("finalize");

        let t = tracker(store.clone(), 1);
        t.enqueue(JobKind::Grading, attempt.id).await.expect("enqueue");
        let job = wait_done(&t, JobKind::Grading, attempt.id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.items_total, 1);
        assert_eq!(job.items_failed, 1);

        let record = store
            .answers_for(attempt.id)
            .await
            .into_iter()
            .find(|r| r.question_id == essay.id)
            .expect("essay record");
        assert_eq!(record.grading_status, GradingStatus::Failed);
        assert_eq!(record.graded_by, Some(GradedBy::PendingManualReview));
        assert!(record.feedback.as_deref().is_some_and(|f| f.starts_with("Auto-grading failed:")));

        // failed answers are settled: the attempt still reaches graded
        let updated = store.attempt(attempt.id).await.expect("attempt");
        assert_eq!(updated.status, AttemptStatus::Graded);
        assert_eq!(updated.score, 2.0);
    }

    #[tokio::test]
    async fn matching_answers_are_settled_without_an_oracle() {
        let p = project();
        let matching = question(
            p.id,
            4.0,
            QuestionKind::Matching {
                pairs: vec![
                    MatchingPair { left: "a".into(), right: "1".into() },
                    MatchingPair { left: "b".into(), right: "2".into() },
                ],
            },
        );
        let store = store_with(&p, vec![matching.clone()], Vec::new());
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();
        store
            .save_answer(
                attempt.id,
                student,
                matching.id,
                json!([{"left": "a", "right": "1"}, {"left": "b", "right": "wrong"}]),
            )
            .await
            .expect("save");
        store.finalize_attempt(attempt.id, student).await.expect("finalize");

        let t = tracker(store.clone(), 1);
        t.enqueue(JobKind::Grading, attempt.id).await.expect("enqueue");
        let job = wait_done(&t, JobKind::Grading, attempt.id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        let record = store
            .answers_for(attempt.id)
            .await
            .into_iter()
            .find(|r| r.question_id == matching.id)
            .expect("record");
        assert_eq!(record.score, 2.0);
        assert_eq!(record.is_correct, Some(false)); // 50% is under the bar
        assert_eq!(record.feedback.as_deref(), Some("Matched 1 out of 2 pairs correctly."));
        assert_eq!(record.graded_by, Some(GradedBy::System));

        let updated = store.attempt(attempt.id).await.expect("attempt");
        assert_eq!(updated.status, AttemptStatus::Graded);
        assert_eq!(updated.score, 2.0);
    }

    #[tokio::test]
    async fn empty_open_answers_settle_as_no_answer() {
        let p = project();
        let essay = question(p.id, 5.0, QuestionKind::Essay { rubric: vec![] });
        let store = store_with(&p, vec![essay.clone()], Vec::new());
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();
        store.save_answer(attempt.id, student, essay.id, json!("")).await.expect("save");
        store.finalize_attempt(attempt.id, student).await.expect("finalize");

        let t = tracker(store.clone(), 1);
        t.enqueue(JobKind::Grading, attempt.id).await.expect("enqueue");
        let job = wait_done(&t, JobKind::Grading, attempt.id).await;

        assert_eq!(job.status, JobStatus::Completed);
        let record = store
            .answers_for(attempt.id)
            .await
            .into_iter()
            .find(|r| r.question_id == essay.id)
            .expect("record");
        assert_eq!(record.score, 0.0);
        assert_eq!(record.feedback.as_deref(), Some("No answer provided."));
        assert_eq!(record.graded_by, Some(GradedBy::System));
        assert_eq!(record.is_correct, Some(false));
    }

    #[tokio::test]
    async fn indexing_folds_materials_and_flags_empty_ones() {
        let p = project();
        let good = Material {
            id: Uuid::new_v4(),
            project_id: p.id,
            title: "Chapter 1".into(),
            content: "Photosynthesis converts light into energy.".into(),
        };
        let empty = Material {
            id: Uuid::new_v4(),
            project_id: p.id,
            title: "Blank".into(),
            content: "   ".into(),
        };
        let store = store_with(&p, Vec::new(), vec![good, empty]);
        let t = tracker(store.clone(), 1);

        t.enqueue(JobKind::Indexing, p.id).await.expect("enqueue");
        let job = wait_done(&t, JobKind::Indexing, p.id).await;

        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(job.items_total, 2);
        assert_eq!(job.items_failed, 1);
        assert_eq!(job.error.as_deref(), Some("1 of 2 items failed"));

        let indexed = store.project(p.id).await.expect("project");
        let source = indexed.source_ref.expect("source ref");
        assert!(source.contains("## Chapter 1"));
        assert!(source.contains("Photosynthesis"));
        assert!(!source.contains("Blank"));
    }

    #[tokio::test]
    async fn generation_needs_an_indexed_source_and_an_oracle() {
        let mut p = project();
        p.question_types = vec![crate::domain::QuestionTypeConfig {
            kind: "single-choice".into(),
            count: 2,
        }];
        let store = store_with(&p, Vec::new(), Vec::new());
        let t = tracker(store.clone(), 1);

        // no source_ref yet
        t.enqueue(JobKind::Generation, p.id).await.expect("enqueue");
        let job = wait_done(&t, JobKind::Generation, p.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Project materials are not indexed yet"));

        // with a source but no oracle the job fails transparently
        store.set_source_ref(p.id, "notes".into()).await.expect("source");
        t.enqueue(JobKind::Generation, p.id).await.expect("enqueue again");
        let job = wait_done(&t, JobKind::Generation, p.id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().is_some_and(|e| e.contains("oracle unavailable")));
        // and the project never pretends to be ready
        assert_eq!(store.project(p.id).await.expect("project").status, ProjectStatus::Active);
    }
}
