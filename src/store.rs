//! In-memory store for projects, questions, attempts and answers.
//! Every cross-record rule (one attempt per student, finalize-once,
//! score recomputation) runs inside a single write-lock section here.
//!
//! Lock order is attempts, then questions, then answers. Never acquire
//! them in any other order.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    AnswerRecord, AttemptStatus, GradedBy, GradingStatus, Material, Project, ProjectStatus,
    Question, TestAttempt,
};
use crate::error::AppError;
use crate::grading;

/// Result of `create_or_get_attempt`: either a fresh attempt or the
/// student's in-progress one.
#[derive(Debug)]
pub enum BeginOutcome {
    Created(TestAttempt),
    Existing(TestAttempt),
}

impl BeginOutcome {
    pub fn attempt(&self) -> &TestAttempt {
        match self {
            BeginOutcome::Created(a) | BeginOutcome::Existing(a) => a,
        }
    }
}

/// What finalize reports back to the student.
#[derive(Debug)]
pub struct FinalizeSummary {
    pub attempt: TestAttempt,
    pub correct_count: usize,
    pub total_questions: usize,
    pub passed: bool,
    /// Open-ended answers left for the background grading job.
    pub pending_open: usize,
}

#[derive(Default)]
struct AttemptTable {
    by_id: HashMap<Uuid, TestAttempt>,
    /// (project_id, student_id) -> attempt id; the uniqueness key.
    by_key: HashMap<(Uuid, Uuid), Uuid>,
}

/// Shared store handle; clones are cheap and point at the same tables.
#[derive(Clone, Default)]
pub struct ExamStore {
    projects: Arc<RwLock<HashMap<Uuid, Project>>>,
    questions: Arc<RwLock<HashMap<Uuid, Vec<Question>>>>,
    attempts: Arc<RwLock<AttemptTable>>,
    answers: Arc<RwLock<HashMap<Uuid, Vec<AnswerRecord>>>>,
    materials: Arc<RwLock<HashMap<Uuid, Vec<Material>>>>,
}

impl ExamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from pre-assembled tables (config seeding, tests).
    pub fn from_tables(
        projects: HashMap<Uuid, Project>,
        questions: HashMap<Uuid, Vec<Question>>,
        materials: HashMap<Uuid, Vec<Material>>,
    ) -> Self {
        Self {
            projects: Arc::new(RwLock::new(projects)),
            questions: Arc::new(RwLock::new(questions)),
            attempts: Arc::new(RwLock::new(AttemptTable::default())),
            answers: Arc::new(RwLock::new(HashMap::new())),
            materials: Arc::new(RwLock::new(materials)),
        }
    }

    //
    // Projects and questions
    //

    pub async fn project(&self, id: Uuid) -> Result<Project, AppError> {
        self.projects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("project", id))
    }

    pub async fn set_project_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
    ) -> Result<Project, AppError> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("project", id))?;
        debug!(target: "attempt", project_id = %id, from = ?project.status, to = ?status, "project status change");
        project.status = status;
        Ok(project.clone())
    }

    /// Store the indexed source excerpt produced by the indexing job.
    pub async fn set_source_ref(&self, id: Uuid, source_ref: String) -> Result<(), AppError> {
        let mut projects = self.projects.write().await;
        let project = projects
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("project", id))?;
        project.source_ref = Some(source_ref);
        Ok(())
    }

    pub async fn materials_for(&self, project_id: Uuid) -> Vec<Material> {
        self.materials
            .read()
            .await
            .get(&project_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn questions_for_variant(&self, project_id: Uuid, variant: u32) -> Vec<Question> {
        let questions = self.questions.read().await;
        let mut out: Vec<Question> = questions
            .get(&project_id)
            .map(|qs| {
                qs.iter()
                    .filter(|q| q.variant_number == variant)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|q| q.order);
        out
    }

    /// Swap in a freshly generated question set for one variant. Refused
    /// once any attempt exists, since grading depends on the questions.
    #[instrument(level = "debug", skip(self, fresh))]
    pub async fn replace_questions(
        &self,
        project_id: Uuid,
        variant: u32,
        fresh: Vec<Question>,
    ) -> Result<usize, AppError> {
        let attempts = self.attempts.read().await;
        if attempts.by_key.keys().any(|(p, _)| *p == project_id) {
            return Err(AppError::conflict(
                "Cannot replace questions while attempts exist",
            ));
        }
        let mut questions = self.questions.write().await;
        let slot = questions.entry(project_id).or_default();
        slot.retain(|q| q.variant_number != variant);
        let added = fresh.len();
        slot.extend(fresh);
        info!(target: "jobs", %project_id, variant, added, "replaced question set");
        Ok(added)
    }

    //
    // Attempts
    //

    /// Begin (or resume) the attempt for one (project, student) pair.
    /// Check and insert happen under one write lock, so two racing
    /// begins can never both create.
    #[instrument(level = "debug", skip(self, project), fields(project_id = %project.id))]
    pub async fn create_or_get_attempt(
        &self,
        project: &Project,
        student_id: Uuid,
    ) -> Result<BeginOutcome, AppError> {
        let mut attempts = self.attempts.write().await;
        if let Some(existing_id) = attempts.by_key.get(&(project.id, student_id)) {
            let existing = attempts.by_id.get(existing_id).cloned().ok_or_else(|| {
                AppError::Internal(format!("attempt index out of sync for {existing_id}"))
            })?;
            return match existing.status {
                AttemptStatus::InProgress => Ok(BeginOutcome::Existing(existing)),
                _ => Err(AppError::conflict("You have already completed this test")),
            };
        }

        let questions = self.questions.read().await;
        let mut variants: Vec<u32> = questions
            .get(&project.id)
            .map(|qs| qs.iter().map(|q| q.variant_number).collect())
            .unwrap_or_default();
        variants.sort_unstable();
        variants.dedup();
        if variants.is_empty() {
            return Err(AppError::validation("This test has no questions yet"));
        }
        let variant = variants[rand::thread_rng().gen_range(0..variants.len())];
        let max_score: f64 = questions
            .get(&project.id)
            .map(|qs| {
                qs.iter()
                    .filter(|q| q.variant_number == variant)
                    .map(|q| q.points)
                    .sum()
            })
            .unwrap_or(0.0);
        drop(questions);

        let attempt = TestAttempt {
            id: Uuid::new_v4(),
            project_id: project.id,
            student_id,
            variant_number: variant,
            status: AttemptStatus::InProgress,
            started_at: chrono::Utc::now(),
            completed_at: None,
            score: 0.0,
            max_score,
        };
        attempts.by_key.insert((project.id, student_id), attempt.id);
        attempts.by_id.insert(attempt.id, attempt.clone());
        self.answers.write().await.insert(attempt.id, Vec::new());
        info!(target: "attempt", attempt_id = %attempt.id, %student_id, variant, max_score, "attempt started");
        Ok(BeginOutcome::Created(attempt))
    }

    pub async fn attempt(&self, id: Uuid) -> Result<TestAttempt, AppError> {
        self.attempts
            .read()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found("attempt", id))
    }

    /// Fetch an attempt the given student owns. Foreign attempts read as
    /// not found rather than forbidden.
    pub async fn attempt_owned(
        &self,
        id: Uuid,
        student_id: Uuid,
    ) -> Result<TestAttempt, AppError> {
        let attempt = self.attempt(id).await?;
        if attempt.student_id != student_id {
            return Err(AppError::not_found("attempt", id));
        }
        Ok(attempt)
    }

    /// Upsert one answer. Never grades; grading happens at finalize.
    /// The attempts guard is held until the record lands, so a finalize
    /// cannot run between the status check and the write.
    pub async fn save_answer(
        &self,
        attempt_id: Uuid,
        student_id: Uuid,
        question_id: Uuid,
        answer: serde_json::Value,
    ) -> Result<AnswerRecord, AppError> {
        let attempts = self.attempts.read().await;
        let attempt = attempts
            .by_id
            .get(&attempt_id)
            .filter(|a| a.student_id == student_id)
            .ok_or_else(|| AppError::not_found("attempt", attempt_id))?;
        if attempt.status != AttemptStatus::InProgress {
            return Err(AppError::conflict("Test is not in progress"));
        }

        let questions = self.questions.read().await;
        let belongs = questions.get(&attempt.project_id).is_some_and(|qs| {
            qs.iter()
                .any(|q| q.id == question_id && q.variant_number == attempt.variant_number)
        });
        if !belongs {
            return Err(AppError::validation("Question does not belong to this test"));
        }
        drop(questions);

        let record = AnswerRecord {
            attempt_id,
            question_id,
            answer,
            is_correct: None,
            score: 0.0,
            feedback: None,
            grading_status: GradingStatus::Pending,
            graded_by: None,
            answered_at: chrono::Utc::now(),
        };
        let mut answers = self.answers.write().await;
        let slot = answers.entry(attempt_id).or_default();
        if let Some(existing) = slot.iter_mut().find(|a| a.question_id == question_id) {
            *existing = record.clone();
        } else {
            slot.push(record.clone());
        }
        Ok(record)
    }

    /// Finalize an attempt: grade objective answers, defer open-ended
    /// ones, fix the score and mark the attempt completed. Promotion
    /// to graded only happens in [`Self::recompute_attempt_score`],
    /// once every record is settled. One write section end to end, so
    /// a second finalize can only fail.
    #[instrument(level = "debug", skip(self))]
    pub async fn finalize_attempt(
        &self,
        attempt_id: Uuid,
        student_id: Uuid,
    ) -> Result<FinalizeSummary, AppError> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .by_id
            .get_mut(&attempt_id)
            .filter(|a| a.student_id == student_id)
            .ok_or_else(|| AppError::not_found("attempt", attempt_id))?;
        if attempt.status != AttemptStatus::InProgress {
            return Err(AppError::conflict("You have already completed this test"));
        }

        let questions = self.questions.read().await;
        let variant_questions: Vec<Question> = questions
            .get(&attempt.project_id)
            .map(|qs| {
                qs.iter()
                    .filter(|q| q.variant_number == attempt.variant_number)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(questions);

        let mut answers = self.answers.write().await;
        let records = answers.entry(attempt_id).or_default();

        let mut score = 0.0;
        let mut correct_count = 0;
        let mut pending_open = 0;
        let max_score: f64 = variant_questions.iter().map(|q| q.points).sum();
        for question in &variant_questions {
            let Some(record) = records.iter_mut().find(|r| r.question_id == question.id) else {
                // unanswered: counts as zero, nothing to grade later
                continue;
            };
            let verdict = grading::grade(question, &record.answer);
            record.is_correct = verdict.is_correct;
            record.score = verdict.score;
            record.grading_status = verdict.grading_status;
            match verdict.grading_status {
                GradingStatus::Pending => {
                    record.graded_by = Some(GradedBy::PendingManualReview);
                    pending_open += 1;
                }
                _ => record.graded_by = Some(GradedBy::System),
            }
            score += verdict.score;
            if verdict.is_correct == Some(true) {
                correct_count += 1;
            }
        }

        attempt.score = score;
        attempt.max_score = max_score;
        attempt.completed_at = Some(chrono::Utc::now());
        attempt.status = AttemptStatus::Completed;
        let passed = max_score > 0.0 && score >= max_score * 0.6;
        info!(
            target: "attempt",
            %attempt_id, score, max_score, correct_count, pending_open, passed,
            "attempt finalized"
        );
        Ok(FinalizeSummary {
            attempt: attempt.clone(),
            correct_count,
            total_questions: variant_questions.len(),
            passed,
            pending_open,
        })
    }

    pub async fn answers_for(&self, attempt_id: Uuid) -> Vec<AnswerRecord> {
        self.answers
            .read()
            .await
            .get(&attempt_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Answers still waiting for the background grader, paired with
    /// their questions, in question order.
    pub async fn open_ended_answers(
        &self,
        attempt_id: Uuid,
    ) -> Result<Vec<(Question, AnswerRecord)>, AppError> {
        let attempt = self.attempt(attempt_id).await?;
        let questions = self
            .questions_for_variant(attempt.project_id, attempt.variant_number)
            .await;
        let answers = self.answers.read().await;
        let records = answers.get(&attempt_id).cloned().unwrap_or_default();
        let mut out = Vec::new();
        for question in questions {
            if !question.kind.is_open_ended() {
                continue;
            }
            if let Some(record) = records
                .iter()
                .find(|r| r.question_id == question.id && r.grading_status == GradingStatus::Pending)
            {
                out.push((question, record.clone()));
            }
        }
        Ok(out)
    }

    /// Apply a grading update to one answer record.
    pub async fn update_answer<F>(
        &self,
        attempt_id: Uuid,
        question_id: Uuid,
        apply: F,
    ) -> Result<AnswerRecord, AppError>
    where
        F: FnOnce(&mut AnswerRecord),
    {
        let mut answers = self.answers.write().await;
        let record = answers
            .get_mut(&attempt_id)
            .and_then(|slot| slot.iter_mut().find(|r| r.question_id == question_id))
            .ok_or_else(|| AppError::not_found("answer", question_id))?;
        apply(record);
        Ok(record.clone())
    }

    /// Re-sum the attempt score from its answer records. Once nothing is
    /// pending any more, a completed attempt becomes graded.
    #[instrument(level = "debug", skip(self))]
    pub async fn recompute_attempt_score(&self, attempt_id: Uuid) -> Result<TestAttempt, AppError> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .by_id
            .get_mut(&attempt_id)
            .ok_or_else(|| AppError::not_found("attempt", attempt_id))?;
        let answers = self.answers.read().await;
        let records = answers.get(&attempt_id).map(Vec::as_slice).unwrap_or(&[]);
        attempt.score = grading::round2(records.iter().map(|r| r.score).sum());
        let unsettled = records.iter().any(|r| {
            matches!(
                r.grading_status,
                GradingStatus::Pending | GradingStatus::InProgress
            )
        });
        if attempt.status == AttemptStatus::Completed && !unsettled {
            attempt.status = AttemptStatus::Graded;
        }
        info!(
            target: "jobs",
            %attempt_id, score = attempt.score, status = ?attempt.status,
            "attempt score recomputed"
        );
        Ok(attempt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MatchingPair, QuestionKind};
    use serde_json::json;

    fn project(num_variants: u32) -> Project {
        Project {
            id: Uuid::new_v4(),
            title: "Unit test".into(),
            max_students: 30,
            num_variants,
            status: ProjectStatus::Active,
            start_time: None,
            end_time: None,
            source_ref: None,
            question_types: Vec::new(),
        }
    }

    fn question(project_id: Uuid, variant: u32, points: f64, kind: QuestionKind) -> Question {
        Question {
            id: Uuid::new_v4(),
            project_id,
            variant_number: variant,
            text: "q".into(),
            points,
            order: 0,
            kind,
        }
    }

    fn single_choice(project_id: Uuid, variant: u32, points: f64) -> Question {
        question(
            project_id,
            variant,
            points,
            QuestionKind::SingleChoice {
                options: vec!["a".into(), "b".into()],
                correct_answer: json!(0),
            },
        )
    }

    fn seeded(project: &Project, questions: Vec<Question>) -> ExamStore {
        let mut projects = HashMap::new();
        projects.insert(project.id, project.clone());
        let mut by_project: HashMap<Uuid, Vec<Question>> = HashMap::new();
        for q in questions {
            by_project.entry(q.project_id).or_default().push(q);
        }
        ExamStore::from_tables(projects, by_project, HashMap::new())
    }

    #[tokio::test]
    async fn begin_assigns_a_variant_and_max_score() {
        let p = project(1);
        let q = single_choice(p.id, 1, 2.5);
        let store = seeded(&p, vec![q]);
        let student = Uuid::new_v4();

        let outcome = store.create_or_get_attempt(&p, student).await.expect("begin");
        let attempt = outcome.attempt();
        assert!(matches!(outcome, BeginOutcome::Created(_)));
        assert_eq!(attempt.variant_number, 1);
        assert_eq!(attempt.max_score, 2.5);
        assert_eq!(attempt.status, AttemptStatus::InProgress);

        // second begin resumes the same attempt
        let again = store.create_or_get_attempt(&p, student).await.expect("resume");
        assert!(matches!(again, BeginOutcome::Existing(_)));
        assert_eq!(again.attempt().id, attempt.id);
    }

    #[tokio::test]
    async fn begin_requires_questions() {
        let p = project(1);
        let store = seeded(&p, Vec::new());
        let err = store
            .create_or_get_attempt(&p, Uuid::new_v4())
            .await
            .expect_err("no questions");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_begins_create_exactly_one_attempt() {
        let p = project(1);
        let store = seeded(&p, vec![single_choice(p.id, 1, 1.0)]);
        let student = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let p = p.clone();
            handles.push(tokio::spawn(async move {
                store.create_or_get_attempt(&p, student).await
            }));
        }
        let mut created = 0;
        let mut ids = Vec::new();
        for handle in handles {
            let outcome = handle.await.expect("join").expect("begin");
            if matches!(outcome, BeginOutcome::Created(_)) {
                created += 1;
            }
            ids.push(outcome.attempt().id);
        }
        assert_eq!(created, 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn save_answer_rejects_foreign_questions_and_upserts() {
        let p = project(1);
        let q = single_choice(p.id, 1, 1.0);
        let store = seeded(&p, vec![q.clone()]);
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();

        let err = store
            .save_answer(attempt.id, student, Uuid::new_v4(), json!(0))
            .await
            .expect_err("unknown question");
        assert!(matches!(err, AppError::Validation(_)));

        store
            .save_answer(attempt.id, student, q.id, json!(1))
            .await
            .expect("first save");
        store
            .save_answer(attempt.id, student, q.id, json!(0))
            .await
            .expect("overwrite");
        let answers = store.answers_for(attempt.id).await;
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].answer, json!(0));

        let err = store
            .save_answer(attempt.id, Uuid::new_v4(), q.id, json!(0))
            .await
            .expect_err("foreign student");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn finalize_grades_objective_and_defers_open_ended() {
        let p = project(1);
        let right = single_choice(p.id, 1, 2.0);
        let wrong = single_choice(p.id, 1, 2.0);
        let essay = question(p.id, 1, 6.0, QuestionKind::Essay { rubric: vec![] });
        let store = seeded(&p, vec![right.clone(), wrong.clone(), essay.clone()]);
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();

        store.save_answer(attempt.id, student, right.id, json!(0)).await.expect("save");
        store.save_answer(attempt.id, student, wrong.id, json!(1)).await.expect("save");
        store.save_answer(attempt.id, student, essay.id, json!("my essay")).await.expect("save");

        let summary = store.finalize_attempt(attempt.id, student).await.expect("finalize");
        assert_eq!(summary.attempt.status, AttemptStatus::Completed);
        assert_eq!(summary.attempt.score, 2.0);
        assert_eq!(summary.attempt.max_score, 10.0);
        assert_eq!(summary.correct_count, 1);
        assert_eq!(summary.total_questions, 3);
        assert_eq!(summary.pending_open, 1);
        assert!(!summary.passed);

        let essay_record = store
            .answers_for(attempt.id)
            .await
            .into_iter()
            .find(|r| r.question_id == essay.id)
            .expect("essay record");
        assert_eq!(essay_record.grading_status, GradingStatus::Pending);
        assert_eq!(essay_record.graded_by, Some(GradedBy::PendingManualReview));
        assert_eq!(essay_record.score, 0.0);

        // saving after finalize is refused
        let err = store
            .save_answer(attempt.id, student, right.id, json!(0))
            .await
            .expect_err("closed attempt");
        assert!(matches!(err, AppError::Conflict(_)));

        // and so is a second finalize
        let err = store
            .finalize_attempt(attempt.id, student)
            .await
            .expect_err("double finalize");
        assert!(matches!(err, AppError::Conflict(_)));
        let unchanged = store.attempt(attempt.id).await.expect("attempt");
        assert_eq!(unchanged.score, 2.0);
    }

    #[tokio::test]
    async fn finalize_without_open_answers_is_terminal() {
        let p = project(1);
        let q = single_choice(p.id, 1, 5.0);
        let store = seeded(&p, vec![q.clone()]);
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();
        store.save_answer(attempt.id, student, q.id, json!("0")).await.expect("save");

        let summary = store.finalize_attempt(attempt.id, student).await.expect("finalize");
        assert_eq!(summary.attempt.status, AttemptStatus::Completed);
        assert_eq!(summary.pending_open, 0);
        assert!(summary.passed);

        // a second finalize bounces and leaves the score alone
        let again = store
            .finalize_attempt(attempt.id, student)
            .await
            .expect_err("refinalized");
        assert_eq!(again.to_string(), "You have already completed this test");
        let unchanged = store.attempt(attempt.id).await.expect("attempt");
        assert_eq!(unchanged.score, summary.attempt.score);

        // begin after completion is a conflict
        let err = store
            .create_or_get_attempt(&p, student)
            .await
            .expect_err("already done");
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn unanswered_questions_count_as_zero() {
        let p = project(1);
        let answered = single_choice(p.id, 1, 3.0);
        let skipped = single_choice(p.id, 1, 3.0);
        let store = seeded(&p, vec![answered.clone(), skipped]);
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();
        store.save_answer(attempt.id, student, answered.id, json!(0)).await.expect("save");

        let summary = store.finalize_attempt(attempt.id, student).await.expect("finalize");
        assert_eq!(summary.correct_count, 1);
        assert_eq!(summary.total_questions, 2);
        assert_eq!(summary.attempt.score, 3.0);
        assert_eq!(summary.attempt.max_score, 6.0);
        // 3.0 of 6.0 is below the 60% bar
        assert!(!summary.passed);
    }

    #[tokio::test]
    async fn grading_updates_promote_completed_to_graded() {
        let p = project(1);
        let essay = question(
            p.id,
            1,
            10.0,
            QuestionKind::Essay { rubric: vec!["clarity".into()] },
        );
        let store = seeded(&p, vec![essay.clone()]);
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();
        store.save_answer(attempt.id, student, essay.id, json!("long answer")).await.expect("save");
        store.finalize_attempt(attempt.id, student).await.expect("finalize");

        store
            .update_answer(attempt.id, essay.id, |record| {
                record.score = 7.0;
                record.is_correct = Some(true);
                record.grading_status = GradingStatus::Completed;
                record.graded_by = Some(GradedBy::Ai);
                record.feedback = Some("solid".into());
            })
            .await
            .expect("update");
        let updated = store.recompute_attempt_score(attempt.id).await.expect("recompute");
        assert_eq!(updated.score, 7.0);
        assert_eq!(updated.status, AttemptStatus::Graded);
    }

    #[tokio::test]
    async fn matching_answers_wait_for_the_grading_job() {
        let p = project(1);
        let matching = question(
            p.id,
            1,
            4.0,
            QuestionKind::Matching {
                pairs: vec![
                    MatchingPair { left: "a".into(), right: "1".into() },
                    MatchingPair { left: "b".into(), right: "2".into() },
                ],
            },
        );
        let store = seeded(&p, vec![matching.clone()]);
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
                json!([{"left": "a", "right": "1"}, {"left": "b", "right": "1"}]),
            )
            .await
            .expect("save");
        store.finalize_attempt(attempt.id, student).await.expect("finalize");

        let open = store.open_ended_answers(attempt.id).await.expect("open answers");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0.id, matching.id);
        assert_eq!(open[0].1.grading_status, GradingStatus::Pending);
    }

    #[tokio::test]
    async fn replace_questions_is_refused_once_attempts_exist() {
        let p = project(1);
        let q = single_choice(p.id, 1, 1.0);
        let store = seeded(&p, vec![q]);

        let fresh = vec![single_choice(p.id, 1, 2.0)];
        store
            .replace_questions(p.id, 1, fresh.clone())
            .await
            .expect("replace before attempts");

        store
            .create_or_get_attempt(&p, Uuid::new_v4())
            .await
            .expect("begin");
        let err = store
            .replace_questions(p.id, 1, fresh)
            .await
            .expect_err("attempts exist");
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saves_racing_finalize_never_strand_ungraded_answers() {
        let p = project(1);
        let q = single_choice(p.id, 1, 5.0);
        let store = seeded(&p, vec![q.clone()]);
        let student = Uuid::new_v4();
        let attempt = store
            .create_or_get_attempt(&p, student)
            .await
            .expect("begin")
            .attempt()
            .clone();
        store.save_answer(attempt.id, student, q.id, json!(0)).await.expect("save");

        // park both calls at the questions lock, then release them together
        let gate = store.questions.write().await;
        let saver = {
            let store = store.clone();
            let (attempt_id, question_id) = (attempt.id, q.id);
            tokio::spawn(async move {
                store.save_answer(attempt_id, student, question_id, json!(1)).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let finalizer = {
            let store = store.clone();
            let attempt_id = attempt.id;
            tokio::spawn(async move { store.finalize_attempt(attempt_id, student).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(gate);

        let save_result = saver.await.expect("saver task");
        finalizer.await.expect("finalizer task").expect("finalize");

        // whichever side won, the surviving record went through grading
        // and the attempt score agrees with it
        let records = store.answers_for(attempt.id).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].grading_status, GradingStatus::Completed);
        let settled = store.attempt(attempt.id).await.expect("attempt");
        assert_eq!(settled.status, AttemptStatus::Completed);
        assert_eq!(settled.score, records[0].score);
        match save_result {
            Ok(record) => assert_eq!(records[0].answer, record.answer),
            Err(err) => {
                assert_eq!(err.to_string(), "Test is not in progress");
                assert_eq!(records[0].answer, json!(0));
            }
        }
    }
}
