//! Answer grading engine. Pure and deterministic: no IO, no clock, no
//! randomness. Objective kinds produce a final verdict synchronously;
//! open-ended kinds are deferred to the background grading job.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::domain::{GradingStatus, MatchingPair, Question, QuestionKind};

/// Outcome of grading a single answer.
#[derive(Clone, Debug, PartialEq)]
pub struct Verdict {
    pub is_correct: Option<bool>,
    pub score: f64,
    pub grading_status: GradingStatus,
}

fn objective(correct: bool, points: f64) -> Verdict {
    Verdict {
        is_correct: Some(correct),
        score: if correct { points } else { 0.0 },
        grading_status: GradingStatus::Completed,
    }
}

fn deferred() -> Verdict {
    Verdict { is_correct: None, score: 0.0, grading_status: GradingStatus::Pending }
}

/// Grade one answer against its question. A missing or malformed answer
/// counts as incorrect; this function never fails.
pub fn grade(question: &Question, answer: &Value) -> Verdict {
    match &question.kind {
        QuestionKind::SingleChoice { correct_answer, .. } => {
            objective(!answer.is_null() && choice_eq(answer, correct_answer), question.points)
        }
        QuestionKind::TrueFalse { correct_answer } => {
            objective(!answer.is_null() && truthy(answer) == truthy(correct_answer), question.points)
        }
        QuestionKind::MultipleChoice { correct_answers, .. } => {
            let correct = match answer {
                Value::Array(selected) => choice_set(selected) == choice_set(correct_answers),
                _ => false,
            };
            objective(correct, question.points)
        }
        QuestionKind::ShortAnswer { .. }
        | QuestionKind::Essay { .. }
        | QuestionKind::Matching { .. } => deferred(),
    }
}

/// Render a JSON value as comparable text. Strings come through without
/// quotes; everything else uses its JSON rendering.
fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Canonical comparison token: digit-only strings collapse to their
/// integer form ("05" and "5" select the same option), everything else
/// compares as trimmed text.
fn canon_token(v: &Value) -> String {
    let text = value_text(v);
    let trimmed = text.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        let stripped = trimmed.trim_start_matches('0');
        if stripped.is_empty() { "0".to_string() } else { stripped.to_string() }
    } else {
        trimmed.to_string()
    }
}

fn choice_eq(a: &Value, b: &Value) -> bool {
    canon_token(a) == canon_token(b)
}

fn choice_set(values: &[Value]) -> BTreeSet<String> {
    values.iter().map(canon_token).collect()
}

/// Truthiness for true/false answers: "true", "1" and "yes" in any case.
fn truthy(v: &Value) -> bool {
    matches!(value_text(v).trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

pub fn percentage_of(score: f64, points: f64) -> f64 {
    if points > 0.0 { round1(score / points * 100.0) } else { 0.0 }
}

//
// Matching settlement (used by the background grading job)
//

#[derive(Clone, Debug, PartialEq)]
pub struct MatchingVerdict {
    pub matched: usize,
    pub total: usize,
    pub score: f64,
    pub percentage: f64,
    pub feedback: String,
}

/// Extract the submitted left-to-right mapping. Accepts either a list of
/// `{left, right}` objects or a plain object map; anything else is empty.
pub fn matching_answer_map(answer: &Value) -> HashMap<String, String> {
    let mut map = HashMap::new();
    match answer {
        Value::Array(items) => {
            for item in items {
                let left = item.get("left").and_then(Value::as_str);
                let right = item.get("right").and_then(Value::as_str);
                if let (Some(l), Some(r)) = (left, right) {
                    map.insert(l.to_string(), r.to_string());
                }
            }
        }
        Value::Object(entries) => {
            for (left, right) in entries {
                if let Some(r) = right.as_str() {
                    map.insert(left.clone(), r.to_string());
                }
            }
        }
        _ => {}
    }
    map
}

/// Proportional credit over the answer key, rounded to two decimals.
pub fn grade_matching_pairs(
    pairs: &[MatchingPair],
    submitted: &HashMap<String, String>,
    points: f64,
) -> MatchingVerdict {
    let total = pairs.len();
    let matched = pairs
        .iter()
        .filter(|p| submitted.get(&p.left) == Some(&p.right))
        .count();
    let (score, percentage) = if total > 0 {
        let fraction = matched as f64 / total as f64;
        (round2(fraction * points), round1(fraction * 100.0))
    } else {
        (0.0, 0.0)
    };
    MatchingVerdict {
        matched,
        total,
        score,
        percentage,
        feedback: format!("Matched {matched} out of {total} pairs correctly."),
    }
}

//
// Weighted-criteria scoring (used to settle oracle-graded answers)
//

/// One grading criterion: weight decides its share of the final score.
#[derive(Clone, Copy, Debug)]
pub struct CriterionDef {
    pub name: &'static str,
    pub description: &'static str,
    pub weight: f64,
}

/// Every criterion is scored on a 1..=5 scale unless the grader says
/// otherwise.
pub const CRITERION_MAX: f64 = 5.0;

pub const SHORT_ANSWER_CRITERIA: &[CriterionDef] = &[
    CriterionDef {
        name: "accuracy",
        description: "Factual correctness based on source materials",
        weight: 0.5,
    },
    CriterionDef {
        name: "completeness",
        description: "Coverage of all key aspects of the question",
        weight: 0.3,
    },
    CriterionDef {
        name: "relevance",
        description: "Direct relevance to the question asked",
        weight: 0.2,
    },
];

pub const ESSAY_CRITERIA: &[CriterionDef] = &[
    CriterionDef {
        name: "content_accuracy",
        description: "Factual correctness and accuracy of information",
        weight: 0.25,
    },
    CriterionDef {
        name: "depth_of_understanding",
        description: "Analysis depth, critical thinking, not just repetition",
        weight: 0.25,
    },
    CriterionDef {
        name: "structure_organization",
        description: "Logical flow, clear structure, coherent argumentation",
        weight: 0.2,
    },
    CriterionDef {
        name: "use_of_evidence",
        description: "References to source materials, examples, supporting facts",
        weight: 0.15,
    },
    CriterionDef {
        name: "language_clarity",
        description: "Clear expression, appropriate terminology, readability",
        weight: 0.15,
    },
];

pub fn criteria_for(kind: &QuestionKind) -> &'static [CriterionDef] {
    match kind {
        QuestionKind::Essay { .. } => ESSAY_CRITERIA,
        _ => SHORT_ANSWER_CRITERIA,
    }
}

/// One scored criterion as reported by the grader.
#[derive(Clone, Debug)]
pub struct CriterionScore {
    pub name: String,
    pub score: f64,
    pub max_score: f64,
}

/// Collapse per-criterion scores into a final point value. Criteria the
/// definition table does not know still count, with a small weight.
pub fn weighted_score(defs: &[CriterionDef], scores: &[CriterionScore], points: f64) -> f64 {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for c in scores {
        let weight = defs
            .iter()
            .find(|d| d.name == c.name)
            .map(|d| d.weight)
            .unwrap_or(0.1);
        let max = if c.max_score > 0.0 { c.max_score } else { CRITERION_MAX };
        weighted_sum += (c.score / max) * weight;
        total_weight += weight;
    }
    if total_weight == 0.0 {
        return 0.0;
    }
    round2(weighted_sum / total_weight * points).clamp(0.0, points)
}
