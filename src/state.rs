//! Application state: the exam store, lobby registry, job tracker and the
//! optional oracle client, assembled once at startup.
//!
//! Projects come from the TOML bank (`EXAM_CONFIG_PATH`). Entries with inline
//! questions start out ready; entries with only materials start as drafts and
//! go through the indexing and generation jobs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument};
use uuid::Uuid;

#[cfg(test)]
use crate::config::Prompts;
use crate::config::{load_config_from_env, AppConfig};
use crate::domain::{Material, Project, ProjectStatus, Question};
use crate::jobs::JobTracker;
use crate::lobby::LobbyRegistry;
use crate::oracle::Oracle;
use crate::store::ExamStore;

const DEFAULT_JOB_WORKERS: usize = 4;

#[derive(Clone)]
pub struct AppState {
    pub store: ExamStore,
    pub lobbies: LobbyRegistry,
    pub jobs: JobTracker,
}

impl AppState {
    /// Build state from env: load config, seed the project bank, init the
    /// oracle client and the job worker pool.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_config_from_env().unwrap_or_default();
        let prompts = Arc::new(cfg.prompts.clone());

        let (projects, questions, materials) = seed_from_config(&cfg);
        let question_count: usize = questions.values().map(Vec::len).sum();
        let material_count: usize = materials.values().map(Vec::len).sum();
        info!(
            target: "examroom",
            projects = projects.len(),
            questions = question_count,
            materials = material_count,
            "Startup project inventory"
        );
        let store = ExamStore::from_tables(projects, questions, materials);

        let oracle = Oracle::from_env();
        if let Some(o) = &oracle {
            info!(target: "examroom", base_url = %o.base_url, fast_model = %o.fast_model, strong_model = %o.strong_model, "Oracle enabled.");
        } else {
            info!(target: "examroom", "Oracle disabled (no ORACLE_API_KEY). Objective grading only; open answers wait for manual review.");
        }

        let workers = std::env::var("JOB_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|w| *w > 0)
            .unwrap_or(DEFAULT_JOB_WORKERS);
        let jobs = JobTracker::new(store.clone(), oracle, prompts, workers);

        Self {
            store,
            lobbies: LobbyRegistry::new(),
            jobs,
        }
    }

    #[cfg(test)]
    pub fn from_parts(store: ExamStore, oracle: Option<Oracle>, prompts: Prompts) -> Self {
        let jobs = JobTracker::new(store.clone(), oracle, Arc::new(prompts), 1);
        Self {
            store,
            lobbies: LobbyRegistry::new(),
            jobs,
        }
    }
}

/// Turn the TOML bank into store tables. Invalid entries are logged and
/// skipped, never fatal.
fn seed_from_config(
    cfg: &AppConfig,
) -> (
    HashMap<Uuid, Project>,
    HashMap<Uuid, Vec<Question>>,
    HashMap<Uuid, Vec<Material>>,
) {
    let mut projects = HashMap::new();
    let mut questions: HashMap<Uuid, Vec<Question>> = HashMap::new();
    let mut materials: HashMap<Uuid, Vec<Material>> = HashMap::new();

    for pc in &cfg.projects {
        let id = pc.id.unwrap_or_else(Uuid::new_v4);
        let start_time = match parse_bank_time(pc.start_time.as_deref()) {
            Ok(t) => t,
            Err(e) => {
                error!(target: "examroom", %id, title = %pc.title, error = %e, "Skipping bank project: bad start_time.");
                continue;
            }
        };
        let end_time = match parse_bank_time(pc.end_time.as_deref()) {
            Ok(t) => t,
            Err(e) => {
                error!(target: "examroom", %id, title = %pc.title, error = %e, "Skipping bank project: bad end_time.");
                continue;
            }
        };

        let mut order_by_variant: HashMap<u32, u32> = HashMap::new();
        let mut bank_questions = Vec::new();
        for qc in &pc.questions {
            if qc.text.trim().is_empty() {
                error!(target: "examroom", %id, title = %pc.title, "Skipping bank question: empty text.");
                continue;
            }
            let variant = qc.variant.max(1);
            let order = order_by_variant.entry(variant).or_insert(0);
            bank_questions.push(Question {
                id: Uuid::new_v4(),
                project_id: id,
                variant_number: variant,
                text: qc.text.clone(),
                points: qc.points,
                order: *order,
                kind: qc.kind.clone(),
            });
            *order += 1;
        }

        let status = if bank_questions.is_empty() {
            ProjectStatus::Draft
        } else {
            ProjectStatus::Ready
        };
        let project = Project {
            id,
            title: pc.title.clone(),
            max_students: pc.max_students,
            num_variants: pc.num_variants.max(1),
            status,
            start_time,
            end_time,
            source_ref: None,
            question_types: pc.question_types.clone(),
        };
        info!(
            target: "examroom",
            %id, title = %project.title, ?status,
            questions = bank_questions.len(),
            materials = pc.materials.len(),
            variants = project.num_variants,
            "Configured project"
        );

        if !bank_questions.is_empty() {
            questions.insert(id, bank_questions);
        }
        if !pc.materials.is_empty() {
            materials.insert(
                id,
                pc.materials
                    .iter()
                    .map(|mc| Material {
                        id: Uuid::new_v4(),
                        project_id: id,
                        title: mc.title.clone(),
                        content: mc.content.clone(),
                    })
                    .collect(),
            );
        }
        projects.insert(id, project);
    }

    (projects, questions, materials)
}

fn parse_bank_time(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s).map(|t| Some(t.with_timezone(&Utc))),
    }
}
