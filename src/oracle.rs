//! Minimal oracle client for question generation and open-answer grading.
//!
//! We only call chat.completions in strict JSON mode. Calls are instrumented
//! and log model names, latencies, and token usage (not contents).
//!
//! NOTE: We never log the API key and we keep payload truncations short.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Prompts;
use crate::domain::{MatchingPair, Question, QuestionKind, QuestionTypeConfig};
use crate::error::AppError;
use crate::grading::{self, CriterionScore};
use crate::util::{fill_template, trunc_for_log};

/// Cap on student answer text forwarded to the oracle.
const ANSWER_CHAR_CAP: usize = 10_000;
/// Cap on source material excerpt embedded in prompts.
const SOURCE_CHAR_CAP: usize = 6_000;

#[derive(Clone)]
pub struct Oracle {
    pub client: reqwest::Client,
    pub api_key: String,
    pub base_url: String,
    pub fast_model: String,
    pub strong_model: String,
}

/// Settled grade for one open-ended answer.
#[derive(Clone, Debug)]
pub struct OpenGrade {
    pub score: f64,
    pub percentage: f64,
    pub feedback: String,
}

impl Oracle {
    /// Construct the client if we find ORACLE_API_KEY; otherwise return None
    /// and the service runs degraded (open answers wait for manual review).
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("ORACLE_API_KEY").ok()?;
        let base_url =
            std::env::var("ORACLE_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
        let fast_model =
            std::env::var("ORACLE_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        let strong_model =
            std::env::var("ORACLE_STRONG_MODEL").unwrap_or_else(|_| "gpt-4o".into());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;

        Some(Self { client, api_key, base_url, fast_model, strong_model })
    }

    /// JSON-object chat completion. Generic over the target type T.
    #[instrument(level = "info", skip(self, system, user), fields(model = %model))]
    async fn chat_json<T: for<'a> Deserialize<'a>>(
        &self,
        model: &str,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> Result<T, AppError> {
        let url = format!("{}/chat/completions", self.base_url);
        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessageReq { role: "system".into(), content: system.into() },
                ChatMessageReq { role: "user".into(), content: user.into() },
            ],
            temperature,
            response_format: Some(ResponseFormat { r#type: "json_object".into() }),
            max_tokens: None,
        };

        let res = self
            .client
            .post(&url)
            .header(USER_AGENT, "examroom-backend/0.1")
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&req)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            let msg = extract_oracle_error(&body).unwrap_or_else(|| trunc_for_log(&body, 300));
            return Err(AppError::OracleTransient(format!("HTTP {}: {}", status, msg)));
        }

        let body: ChatCompletionResponse = res.json().await?;
        if let Some(usage) = &body.usage {
            info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "oracle usage");
        }
        let text = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        serde_json::from_str::<T>(&text).map_err(|e| {
            warn!(snippet = %trunc_for_log(&text, 200), "oracle payload was not valid JSON");
            AppError::OracleTransient(format!("bad oracle payload: {e}"))
        })
    }

    // --- High-level helpers (domain-specialized) ---

    /// Generate one variant's question set from the indexed source. One call
    /// per configured question type; malformed items are skipped, not fatal.
    #[instrument(
        level = "info",
        skip(self, prompts, source, type_config),
        fields(%project_id, variant, source_len = source.len(), model = %self.strong_model)
    )]
    pub async fn generate_questions(
        &self,
        prompts: &Prompts,
        project_id: Uuid,
        variant: u32,
        source: &str,
        hint: &str,
        type_config: &[QuestionTypeConfig],
    ) -> Result<Vec<Question>, AppError> {
        let source = truncate_chars(source, SOURCE_CHAR_CAP);
        let mut out = Vec::new();
        let mut order: u32 = 0;
        for config in type_config {
            let Some(format) = format_for(&config.kind) else {
                warn!(kind = %config.kind, "unknown question type in config, skipping");
                continue;
            };
            let count = config.count.to_string();
            let user = fill_template(
                &prompts.generation_user_template,
                &[
                    ("count", count.as_str()),
                    ("kind", config.kind.as_str()),
                    ("source", source.as_str()),
                    ("hint", hint),
                    ("format", format),
                ],
            );
            let start = std::time::Instant::now();
            let raw: Value = self
                .chat_json(&self.strong_model, &prompts.generation_system, &user, 0.7)
                .await?;
            info!(kind = %config.kind, elapsed = ?start.elapsed(), "question batch received");

            let mut accepted = 0usize;
            for item in unwrap_batch(raw) {
                if accepted >= config.count as usize {
                    break;
                }
                match convert_generated(&config.kind, &item, project_id, variant, order) {
                    Some(question) => {
                        out.push(question);
                        order += 1;
                        accepted += 1;
                    }
                    None => {
                        warn!(kind = %config.kind, "invalid generated question skipped");
                    }
                }
            }
        }
        Ok(out)
    }

    /// Score one essay or short answer against the criteria table for its
    /// kind. The weighted final score is computed locally from the oracle's
    /// per-criterion scores.
    #[instrument(
        level = "info",
        skip(self, prompts, question, answer_text, source),
        fields(question_id = %question.id, answer_len = answer_text.len(), model = %self.fast_model)
    )]
    pub async fn grade_open_answer(
        &self,
        prompts: &Prompts,
        question: &Question,
        answer_text: &str,
        source: Option<&str>,
    ) -> Result<OpenGrade, AppError> {
        let defs = grading::criteria_for(&question.kind);
        let criteria_json = criteria_as_json(defs);
        let expected = expected_line(&question.kind);
        let source_txt = source
            .map(|s| truncate_chars(s, SOURCE_CHAR_CAP))
            .unwrap_or_else(|| "No source materials available.".to_string());
        let answer = sanitize_for_prompt(answer_text, ANSWER_CHAR_CAP);

        let user = fill_template(
            &prompts.grading_user_template,
            &[
                ("criteria", criteria_json.as_str()),
                ("source", source_txt.as_str()),
                ("expected", expected.as_str()),
                ("question", question.text.as_str()),
                ("answer", answer.as_str()),
            ],
        );
        let graded: OracleGrade = self
            .chat_json(&self.fast_model, &prompts.grading_system, &user, 0.2)
            .await?;

        let scores: Vec<CriterionScore> = graded
            .criteria
            .iter()
            .map(|c| CriterionScore { name: c.name.clone(), score: c.score, max_score: c.max_score })
            .collect();
        let score = grading::weighted_score(defs, &scores, question.points);
        let percentage = grading::percentage_of(score, question.points);
        info!(question_id = %question.id, score, percentage, "open answer graded");
        Ok(OpenGrade { score, percentage, feedback: graded.overall_feedback })
    }
}

/// Expected-answer line embedded in the grading prompt.
fn expected_line(kind: &QuestionKind) -> String {
    match kind {
        QuestionKind::ShortAnswer { expected_keywords } if !expected_keywords.is_empty() => {
            format!("Expected keywords: {}", expected_keywords.join(", "))
        }
        QuestionKind::ShortAnswer { .. } => "No expected keywords provided.".to_string(),
        QuestionKind::Essay { rubric } if !rubric.is_empty() => {
            format!("Rubric criteria: {}", rubric.join(", "))
        }
        _ => "No specific rubric provided.".to_string(),
    }
}

fn criteria_as_json(defs: &[grading::CriterionDef]) -> String {
    let items: Vec<Value> = defs
        .iter()
        .map(|d| {
            serde_json::json!({
                "name": d.name,
                "description": d.description,
                "maxScore": grading::CRITERION_MAX,
                "weight": d.weight,
            })
        })
        .collect();
    serde_json::to_string_pretty(&items).unwrap_or_else(|_| "[]".to_string())
}

/// Per-kind JSON shape instructions for the generation prompt.
fn format_for(kind: &str) -> Option<&'static str> {
    Some(match kind {
        "single-choice" => {
            r#"Each question: {"text": "question text", "options": ["option1", "option2", "option3", "option4"], "correctAnswer": 0} where correctAnswer is the index of the single correct option."#
        }
        "multiple-choice" => {
            r#"Each question: {"text": "question text", "options": ["option1", "option2", "option3", "option4"], "correctAnswers": [0, 2]} with 2-3 correct option indices."#
        }
        "true-false" => {
            r#"Each question: {"text": "statement text", "correctAnswer": true} where correctAnswer is a boolean."#
        }
        "short-answer" => {
            r#"Each question: {"text": "question text", "expectedKeywords": ["keyword1", "keyword2"]} listing keywords a good answer contains."#
        }
        "essay" => {
            r#"Each question: {"text": "question text", "rubric": ["criteria1", "criteria2", "criteria3"]} listing grading criteria."#
        }
        "matching" => {
            r#"Each question: {"text": "Match the following items:", "pairs": [{"left": "term1", "right": "definition1"}, {"left": "term2", "right": "definition2"}]} with 4-5 pairs."#
        }
        _ => return None,
    })
}

/// The model may answer with a bare array, a `{"questions": [...]}` wrapper,
/// or a single object. Normalize all three to a list.
fn unwrap_batch(raw: Value) -> Vec<Value> {
    match raw {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("questions") {
            Some(Value::Array(items)) => items,
            _ => vec![Value::Object(map)],
        },
        _ => Vec::new(),
    }
}

fn str_vec(v: Option<&Value>) -> Option<Vec<String>> {
    let items = v?.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item.as_str()?.to_string());
    }
    Some(out)
}

/// Validate one generated item and convert it into a domain question.
/// Returns None for anything malformed.
fn convert_generated(
    kind: &str,
    raw: &Value,
    project_id: Uuid,
    variant: u32,
    order: u32,
) -> Option<Question> {
    let text = raw.get("text")?.as_str()?.trim().to_string();
    if text.is_empty() {
        return None;
    }
    let kind = match kind {
        "single-choice" => {
            let options = str_vec(raw.get("options")).filter(|o| o.len() >= 2)?;
            let correct = raw.get("correctAnswer")?.as_u64()?;
            if correct as usize >= options.len() {
                return None;
            }
            QuestionKind::SingleChoice {
                options,
                correct_answer: Value::from(correct),
            }
        }
        "multiple-choice" => {
            let options = str_vec(raw.get("options")).filter(|o| o.len() >= 2)?;
            let indices = raw.get("correctAnswers")?.as_array()?;
            let mut correct_answers = Vec::with_capacity(indices.len());
            for idx in indices {
                let i = idx.as_u64()?;
                if i as usize >= options.len() {
                    return None;
                }
                correct_answers.push(Value::from(i));
            }
            if correct_answers.is_empty() {
                return None;
            }
            QuestionKind::MultipleChoice { options, correct_answers }
        }
        "true-false" => {
            let correct = raw.get("correctAnswer")?.as_bool()?;
            QuestionKind::TrueFalse { correct_answer: Value::from(correct) }
        }
        "short-answer" => QuestionKind::ShortAnswer { expected_keywords: str_vec(raw.get("expectedKeywords"))? },
        "essay" => QuestionKind::Essay { rubric: str_vec(raw.get("rubric"))? },
        "matching" => {
            let pairs: Vec<MatchingPair> =
                serde_json::from_value(raw.get("pairs")?.clone()).ok()?;
            if pairs.len() < 2 {
                return None;
            }
            QuestionKind::Matching { pairs }
        }
        _ => return None,
    };
    Some(Question {
        id: Uuid::new_v4(),
        project_id,
        variant_number: variant,
        text,
        points: raw.get("points").and_then(Value::as_f64).unwrap_or(1.0),
        order,
        kind,
    })
}

fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        s.to_string()
    } else {
        s.chars().take(cap).collect()
    }
}

/// Strip fence and directive noise from student text before it lands in a
/// prompt, and cap its length.
fn sanitize_for_prompt(text: &str, cap: usize) -> String {
    let mut out = String::with_capacity(text.len().min(cap));
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            continue;
        }
        let cleaned = line.replace("```", "").replace("<|", "").replace("|>", "");
        out.push_str(&cleaned);
        out.push('\n');
    }
    truncate_chars(out.trim(), cap)
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessageReq>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq {
    role: String,
    content: String,
}
#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    r#type: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResp,
}
#[derive(Deserialize)]
struct ChatMessageResp {
    content: Option<String>,
}
#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    total_tokens: Option<u32>,
}

fn default_criterion_max() -> f64 {
    grading::CRITERION_MAX
}

#[derive(Deserialize)]
struct OracleGrade {
    #[serde(default)]
    criteria: Vec<OracleCriterion>,
    #[serde(default, rename = "overallFeedback")]
    overall_feedback: String,
}
#[derive(Deserialize)]
struct OracleCriterion {
    name: String,
    score: f64,
    #[serde(default = "default_criterion_max", rename = "maxScore")]
    max_score: f64,
}

/// Try to extract a clean error message from an oracle error body.
fn extract_oracle_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct EWrap {
        error: EObj,
    }
    #[derive(Deserialize)]
    struct EObj {
        message: String,
    }
    match serde_json::from_str::<EWrap>(body) {
        Ok(w) => Some(w.error.message),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn batch_unwrapping_accepts_all_three_shapes() {
        assert_eq!(unwrap_batch(json!([{"text": "a"}])).len(), 1);
        assert_eq!(unwrap_batch(json!({"questions": [{"text": "a"}, {"text": "b"}]})).len(), 2);
        assert_eq!(unwrap_batch(json!({"text": "a"})).len(), 1);
        assert!(unwrap_batch(json!("nope")).is_empty());
    }

    #[test]
    fn generated_single_choice_is_validated() {
        let pid = Uuid::new_v4();
        let good = json!({"text": "pick", "options": ["a", "b", "c"], "correctAnswer": 1});
        let q = convert_generated("single-choice", &good, pid, 1, 0).expect("valid");
        assert_eq!(q.points, 1.0);
        assert_eq!(q.kind.tag(), "single-choice");

        let out_of_range = json!({"text": "pick", "options": ["a", "b"], "correctAnswer": 5});
        assert!(convert_generated("single-choice", &out_of_range, pid, 1, 0).is_none());

        let one_option = json!({"text": "pick", "options": ["a"], "correctAnswer": 0});
        assert!(convert_generated("single-choice", &one_option, pid, 1, 0).is_none());

        let no_text = json!({"text": "  ", "options": ["a", "b"], "correctAnswer": 0});
        assert!(convert_generated("single-choice", &no_text, pid, 1, 0).is_none());
    }

    #[test]
    fn generated_matching_needs_two_pairs() {
        let pid = Uuid::new_v4();
        let good = json!({
            "text": "match",
            "pairs": [{"left": "a", "right": "1"}, {"left": "b", "right": "2"}],
            "points": 4,
        });
        let q = convert_generated("matching", &good, pid, 2, 3).expect("valid");
        assert_eq!(q.points, 4.0);
        assert_eq!(q.variant_number, 2);
        assert_eq!(q.order, 3);

        let short = json!({"text": "match", "pairs": [{"left": "a", "right": "1"}]});
        assert!(convert_generated("matching", &short, pid, 1, 0).is_none());
        assert!(convert_generated("mystery-kind", &good, pid, 1, 0).is_none());
    }

    #[test]
    fn prompt_sanitizer_strips_noise_and_caps_length() {
        let noisy = "real answer\n[system override]\n```rust\ncode\n```\nmore <|tag|> text";
        let clean = sanitize_for_prompt(noisy, 1000);
        assert!(!clean.contains("system override"));
        assert!(!clean.contains("```"));
        assert!(!clean.contains("<|"));
        assert!(clean.contains("real answer"));
        assert!(clean.contains("more tag text"));

        let capped = sanitize_for_prompt(&"x".repeat(50), 10);
        assert_eq!(capped.chars().count(), 10);
    }

    #[test]
    fn expected_line_matches_question_kind() {
        let short = QuestionKind::ShortAnswer { expected_keywords: vec!["ph".into(), "acid".into()] };
        assert_eq!(expected_line(&short), "Expected keywords: ph, acid");
        let bare = QuestionKind::Essay { rubric: vec![] };
        assert_eq!(expected_line(&bare), "No specific rubric provided.");
    }
}
