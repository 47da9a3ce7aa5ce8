//! LLM-backed judge that scores a (prompt, input, response) triplet 0-100.
//!
//! Parse precedence for the judge's reply:
//! 1. the first JSON object in the text (score, breakdown, reasoning)
//! 2. the first standalone 1-3 digit integer, with an empty breakdown
//! 3. score 0 with an explanation
//!
//! Scores are always clamped to [0, 100]. Nothing here returns an error: a
//! failed judge call is itself scored 0.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::candidate::{preview, CaseDetail, CaseId, Candidate, HumanOverride};
use crate::client::{ExecutionError, InferenceBackend, Message};
use crate::prompts::{self, CUSTOM_RUBRIC_HEADER, JUDGE_SYSTEM, JUDGE_USER};
use crate::session::{Session, SessionError, TestBench};

/// Judge calls run deterministic.
pub const JUDGE_TEMPERATURE: f64 = 0.0;

static BARE_SCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3})\b").expect("valid regex"));

/// Four sub-scores, 0-25 each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub relevance: f64,
    #[serde(default)]
    pub clarity: f64,
    #[serde(default)]
    pub instruction_following: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub score: f64,
    pub reasoning: String,
    /// `None` when the score was recovered without JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<Breakdown>,
    /// The judge's reply, kept even when a human overrides the score.
    #[serde(default)]
    pub raw: String,
    #[serde(default)]
    pub is_human_override: bool,
}

impl EvaluationResult {
    pub fn failed(reasoning: impl Into<String>) -> Self {
        EvaluationResult {
            score: 0.0,
            reasoning: reasoning.into(),
            breakdown: None,
            raw: String::new(),
            is_human_override: false,
        }
    }

    /// Replace score and reasoning with a human's, keeping the raw reply.
    pub fn with_override(mut self, over: &HumanOverride) -> Self {
        self.score = over.score.clamp(0.0, 100.0);
        self.reasoning = over.reasoning.clone();
        self.is_human_override = true;
        self
    }
}

/// Anything that can score a response.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, prompt: &str, input: &str, response: &str) -> EvaluationResult;

    /// Human overrides to enforce on session candidates, keyed by candidate id.
    fn overrides(&self) -> Vec<(String, HumanOverride)> {
        Vec::new()
    }
}

/// Pull the first JSON object out of free text.
///
/// Tries the whole string, then the contents of a markdown code fence, then
/// every balanced `{...}` span in order, then first `{` to last `}`.
pub fn extract_json(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if is_json_object(trimmed) {
        return Some(trimmed.to_string());
    }

    let stripped = if trimmed.starts_with("```") {
        let inner = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        if is_json_object(inner) {
            return Some(inner.to_string());
        }
        inner
    } else {
        trimmed
    };

    for (start, _) in stripped.match_indices('{') {
        if let Some(end) = balanced_end(&stripped[start..]) {
            let candidate = &stripped[start..start + end];
            if is_json_object(candidate) {
                return Some(candidate.to_string());
            }
        }
    }

    if let (Some(start), Some(end)) = (stripped.find('{'), stripped.rfind('}')) {
        if start < end {
            let candidate = &stripped[start..=end];
            if is_json_object(candidate) {
                return Some(candidate.to_string());
            }
        }
    }

    None
}

fn is_json_object(text: &str) -> bool {
    matches!(serde_json::from_str::<Value>(text), Ok(Value::Object(_)))
}

/// Byte length of the balanced `{...}` span starting at `text[0]`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Turn a judge reply into an [`EvaluationResult`]. Never fails.
pub fn parse_judgement(text: &str) -> EvaluationResult {
    if let Some(json) = extract_json(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&json) {
            if let Some(score) = value.get("score").and_then(number_field) {
                let breakdown = value.get("breakdown").and_then(|b| {
                    b.is_object().then(|| Breakdown {
                        accuracy: b.get("accuracy").and_then(number_field).unwrap_or(0.0),
                        relevance: b.get("relevance").and_then(number_field).unwrap_or(0.0),
                        clarity: b.get("clarity").and_then(number_field).unwrap_or(0.0),
                        instruction_following: b
                            .get("instruction_following")
                            .and_then(number_field)
                            .unwrap_or(0.0),
                    })
                });
                let reasoning = value
                    .get("reasoning")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return EvaluationResult {
                    score: score.clamp(0.0, 100.0),
                    reasoning,
                    breakdown,
                    raw: text.to_string(),
                    is_human_override: false,
                };
            }
        }
    }

    if let Some(score) = BARE_SCORE_RE
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
    {
        debug!(score, "judge reply had no JSON, used first integer");
        return EvaluationResult {
            score: score.clamp(0.0, 100.0),
            reasoning: format!(
                "Parsed from raw response (JSON parse failed): {}",
                preview(text.trim(), 200)
            ),
            breakdown: None,
            raw: text.to_string(),
            is_human_override: false,
        };
    }

    warn!("judge reply had neither JSON nor a score, scoring 0");
    EvaluationResult {
        score: 0.0,
        reasoning: format!(
            "Could not parse a score from the judge response: {}",
            preview(text.trim(), 200)
        ),
        breakdown: None,
        raw: text.to_string(),
        is_human_override: false,
    }
}

/// The default judge: one zero-temperature call per evaluation.
pub struct LlmJudge {
    backend: Arc<dyn InferenceBackend>,
    system_prompt: String,
}

impl LlmJudge {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        LlmJudge {
            backend,
            system_prompt: JUDGE_SYSTEM.to_string(),
        }
    }

    /// Append user-defined criteria to the judging instruction.
    pub fn set_custom_rubric(&mut self, rubric: &str) {
        let rubric = rubric.trim();
        self.system_prompt = if rubric.is_empty() {
            JUDGE_SYSTEM.to_string()
        } else {
            format!("{}{}{}", JUDGE_SYSTEM, CUSTOM_RUBRIC_HEADER, rubric)
        };
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }
}

impl Evaluator for LlmJudge {
    fn evaluate(&self, prompt: &str, input: &str, response: &str) -> EvaluationResult {
        let user = prompts::render(
            JUDGE_USER,
            &[("prompt", prompt), ("input", input), ("response", response)],
        );
        let conversation = [Message::system(self.system_prompt.clone()), Message::user(user)];
        let result = self.backend.complete(&conversation, Some(JUDGE_TEMPERATURE));

        if !result.success {
            warn!(error = %result.error_message(), "judge call failed");
            return EvaluationResult::failed(format!("Evaluation failed: {}", result.error_message()));
        }
        parse_judgement(&result.content)
    }
}

/// Wraps a judge with a store of human (score, reasoning) pairs.
pub struct HumanOverrideJudge<E: Evaluator> {
    inner: E,
    overrides: Mutex<HashMap<String, HumanOverride>>,
}

impl<E: Evaluator> HumanOverrideJudge<E> {
    pub fn new(inner: E) -> Self {
        HumanOverrideJudge {
            inner,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn set_override(&self, candidate_id: &str, score: f64, reasoning: impl Into<String>) {
        self.overrides.lock().insert(
            candidate_id.to_string(),
            HumanOverride {
                score: score.clamp(0.0, 100.0),
                reasoning: reasoning.into(),
            },
        );
    }

    pub fn get(&self, candidate_id: &str) -> Option<HumanOverride> {
        self.overrides.lock().get(candidate_id).cloned()
    }

    /// Forget the stored override. An optimizer running with this judge
    /// clears it from the session after its next step.
    pub fn clear(&self, candidate_id: &str) -> bool {
        self.overrides.lock().remove(candidate_id).is_some()
    }

    /// A judge result with any stored override for `candidate_id` applied.
    pub fn result_for(&self, candidate_id: &str, result: EvaluationResult) -> EvaluationResult {
        match self.get(candidate_id) {
            Some(over) => result.with_override(&over),
            None => result,
        }
    }

    /// Push every stored override onto the matching session candidates.
    /// Returns how many were applied; ids not in the session are skipped.
    pub fn apply_to(&self, session: &mut Session) -> Result<usize, SessionError> {
        let pending: Vec<(String, HumanOverride)> = self
            .overrides
            .lock()
            .iter()
            .map(|(id, o)| (id.clone(), o.clone()))
            .collect();

        let mut applied = 0;
        for (id, over) in pending {
            if session.contains(&id) {
                session.override_score(&id, over.score, over.reasoning)?;
                applied += 1;
            }
        }
        Ok(applied)
    }
}

impl<E: Evaluator> Evaluator for HumanOverrideJudge<E> {
    fn evaluate(&self, prompt: &str, input: &str, response: &str) -> EvaluationResult {
        self.inner.evaluate(prompt, input, response)
    }

    fn overrides(&self) -> Vec<(String, HumanOverride)> {
        self.overrides
            .lock()
            .iter()
            .map(|(id, o)| (id.clone(), o.clone()))
            .collect()
    }
}

/// Result of executing and judging a prompt on one test case.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseEvaluation {
    pub case: CaseId,
    pub response: String,
    pub result: EvaluationResult,
}

impl CaseEvaluation {
    pub fn record_on(&self, candidate: &mut Candidate) {
        candidate.record_case(
            self.case,
            self.result.score,
            CaseDetail {
                response: self.response.clone(),
                reasoning: self.result.reasoning.clone(),
            },
        );
    }
}

/// Execute `prompt` on every non-empty bench case and judge each response.
/// An execution failure scores that case 0 and moves on.
pub fn evaluate_bench<F>(
    judge: &dyn Evaluator,
    prompt: &str,
    bench: &TestBench,
    mut execute: F,
) -> Vec<CaseEvaluation>
where
    F: FnMut(&str, &str) -> Result<String, ExecutionError>,
{
    bench
        .active_cases()
        .into_iter()
        .map(|(case, input)| match execute(prompt, input) {
            Ok(response) => {
                let result = judge.evaluate(prompt, input, &response);
                CaseEvaluation {
                    case,
                    response,
                    result,
                }
            }
            Err(err) => {
                warn!(case = case.label(), error = %err, "prompt execution failed, scoring case 0");
                CaseEvaluation {
                    case,
                    response: String::new(),
                    result: EvaluationResult::failed(format!("Error: {}", err)),
                }
            }
        })
        .collect()
}
