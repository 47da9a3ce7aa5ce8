//! Candidate prompt variants and their scores.
//!
//! A [`Candidate`] is one concrete prompt produced by a strategy step. Its
//! aggregate score is derived, never set directly: it is the mean of the
//! per-case scores unless a human override is present, in which case it is
//! the override. Every mutator recomputes it, so the invariant holds after
//! any sequence of score writes, overrides and clears.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default pass/fail threshold for the per-case traffic light.
pub const DEFAULT_PASS_THRESHOLD: f64 = 50.0;

/// The four interchangeable optimization engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    #[serde(rename = "iterative")]
    Iterative,
    #[serde(rename = "induction")]
    Induction,
    #[serde(rename = "evolutionary")]
    Evolutionary,
    #[serde(rename = "context-filter")]
    ContextFilter,
}

impl EngineKind {
    pub const ALL: [EngineKind; 4] = [
        EngineKind::Iterative,
        EngineKind::Induction,
        EngineKind::Evolutionary,
        EngineKind::ContextFilter,
    ];

    /// Stable name used in config files, the CLI and serialized sessions.
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Iterative => "iterative",
            EngineKind::Induction => "induction",
            EngineKind::Evolutionary => "evolutionary",
            EngineKind::ContextFilter => "context-filter",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            EngineKind::Iterative => {
                "Iterative meta-prompting: proposes one improved prompt per step from the score history"
            }
            EngineKind::Induction => {
                "Instruction induction: deduces the hidden instruction from worked examples, then resamples it"
            }
            EngineKind::Evolutionary => {
                "Evolutionary search: mutates and recombines a fixed-size population of prompts"
            }
            EngineKind::ContextFilter => {
                "Context filtering: learns a filter that strips noise from retrieved context"
            }
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown engine '{0}' (expected one of: iterative, induction, evolutionary, context-filter)")]
pub struct UnknownEngine(pub String);

impl FromStr for EngineKind {
    type Err = UnknownEngine;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "iterative" => Ok(EngineKind::Iterative),
            "induction" => Ok(EngineKind::Induction),
            "evolutionary" => Ok(EngineKind::Evolutionary),
            "context-filter" | "context_filter" => Ok(EngineKind::ContextFilter),
            _ => Err(UnknownEngine(s.to_string())),
        }
    }
}

/// The three fixed test-bench cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseId {
    GoldenPath,
    EdgeCase,
    Adversarial,
}

impl CaseId {
    pub const ALL: [CaseId; 3] = [CaseId::GoldenPath, CaseId::EdgeCase, CaseId::Adversarial];

    pub fn label(self) -> &'static str {
        match self {
            CaseId::GoldenPath => "golden path",
            CaseId::EdgeCase => "edge case",
            CaseId::Adversarial => "adversarial",
        }
    }
}

/// What the model said for one case and why the judge scored it that way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseDetail {
    pub response: String,
    pub reasoning: String,
}

/// A human-supplied score that wins over the judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanOverride {
    pub score: f64,
    pub reasoning: String,
}

/// Evolutionary operator that produced a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Seed,
    ZeroOrder,
    FirstOrder,
    Crossover,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operator::Seed => "seed",
            Operator::ZeroOrder => "zero-order",
            Operator::FirstOrder => "first-order",
            Operator::Crossover => "crossover",
        };
        write!(f, "{}", name)
    }
}

/// Per-strategy payload carried by a candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyExtra {
    #[default]
    None,
    Iterative {
        generation_reasoning: String,
    },
    Induction {
        /// Indices of the worked examples the instruction was deduced from.
        deduced_from: Vec<usize>,
        /// True for the deduced instruction itself, false for resamples.
        is_original: bool,
    },
    Evolutionary {
        unit_id: String,
        parent_ids: Vec<String>,
        mutation_prompt: String,
        operator: Operator,
        generation: u32,
    },
    ContextFilter {
        clean_context: String,
        filtered_items: Vec<String>,
        noise_reduction_rate: f64,
        pass_number: u32,
    },
}

/// One generated prompt variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub engine: EngineKind,
    pub generation_index: u32,
    pub display_text: String,
    pub full_text: String,
    per_case_scores: BTreeMap<CaseId, f64>,
    #[serde(default)]
    pub case_details: BTreeMap<CaseId, CaseDetail>,
    aggregate_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    human_override: Option<HumanOverride>,
    #[serde(default)]
    pub extra: StrategyExtra,
}

impl Candidate {
    pub fn new(engine: EngineKind, generation_index: u32, full_text: impl Into<String>) -> Self {
        let full_text = full_text.into();
        Candidate {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            engine,
            generation_index,
            display_text: full_text.clone(),
            full_text,
            per_case_scores: BTreeMap::new(),
            case_details: BTreeMap::new(),
            aggregate_score: 0.0,
            human_override: None,
            extra: StrategyExtra::None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_display_text(mut self, text: impl Into<String>) -> Self {
        self.display_text = text.into();
        self
    }

    pub fn with_extra(mut self, extra: StrategyExtra) -> Self {
        self.extra = extra;
        self
    }

    /// Record the judge's score for one case, replacing any earlier one.
    pub fn record_case(&mut self, case: CaseId, score: f64, detail: CaseDetail) {
        self.per_case_scores.insert(case, score.clamp(0.0, 100.0));
        self.case_details.insert(case, detail);
        self.recompute();
    }

    pub fn per_case_scores(&self) -> &BTreeMap<CaseId, f64> {
        &self.per_case_scores
    }

    pub fn case_score(&self, case: CaseId) -> Option<f64> {
        self.per_case_scores.get(&case).copied()
    }

    /// Ranking score: the override if present, else the per-case mean.
    pub fn aggregate_score(&self) -> f64 {
        self.aggregate_score
    }

    /// Mean of the judge's per-case scores, ignoring any override.
    pub fn judge_score(&self) -> f64 {
        if self.per_case_scores.is_empty() {
            return 0.0;
        }
        self.per_case_scores.values().sum::<f64>() / self.per_case_scores.len() as f64
    }

    pub fn human_override(&self) -> Option<&HumanOverride> {
        self.human_override.as_ref()
    }

    pub fn set_override(&mut self, score: f64, reasoning: impl Into<String>) {
        self.human_override = Some(HumanOverride {
            score: score.clamp(0.0, 100.0),
            reasoning: reasoning.into(),
        });
        self.recompute();
    }

    pub fn clear_override(&mut self) {
        self.human_override = None;
        self.recompute();
    }

    /// Restore the derived aggregate after deserialization.
    pub(crate) fn recompute(&mut self) {
        self.aggregate_score = match self.human_override {
            Some(ref o) => o.score,
            None => self.judge_score(),
        };
    }

    /// Traffic light per scored case: true when the case passed.
    pub fn pass_status(&self, threshold: f64) -> BTreeMap<CaseId, bool> {
        self.per_case_scores
            .iter()
            .map(|(case, score)| (*case, *score >= threshold))
            .collect()
    }

    /// Unit id for evolutionary candidates.
    pub fn unit_id(&self) -> Option<&str> {
        match self.extra {
            StrategyExtra::Evolutionary { ref unit_id, .. } => Some(unit_id),
            _ => None,
        }
    }
}

/// Truncate to at most `max` characters, appending "..." when cut.
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(scores: &[(CaseId, f64)]) -> Candidate {
        let mut c = Candidate::new(EngineKind::Iterative, 1, "prompt");
        for (case, score) in scores {
            c.record_case(*case, *score, CaseDetail::default());
        }
        c
    }

    #[test]
    fn aggregate_is_mean_of_cases() {
        let c = scored(&[(CaseId::GoldenPath, 80.0), (CaseId::EdgeCase, 60.0)]);
        assert_eq!(c.aggregate_score(), 70.0);
    }

    #[test]
    fn empty_scores_aggregate_to_zero() {
        let c = Candidate::new(EngineKind::Induction, 0, "p");
        assert_eq!(c.aggregate_score(), 0.0);
    }

    #[test]
    fn override_wins_and_clear_restores_mean() {
        let mut c = scored(&[(CaseId::GoldenPath, 40.0), (CaseId::Adversarial, 60.0)]);
        c.set_override(95.0, "reviewed by hand");
        assert_eq!(c.aggregate_score(), 95.0);

        // New judge scores must not displace an active override.
        c.record_case(CaseId::EdgeCase, 10.0, CaseDetail::default());
        assert_eq!(c.aggregate_score(), 95.0);

        c.set_override(20.0, "changed my mind");
        assert_eq!(c.aggregate_score(), 20.0);

        c.clear_override();
        assert!((c.aggregate_score() - 110.0 / 3.0).abs() < 1e-9);
        c.clear_override();
        assert!((c.aggregate_score() - 110.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn scores_are_clamped() {
        let mut c = scored(&[(CaseId::GoldenPath, 140.0)]);
        assert_eq!(c.aggregate_score(), 100.0);
        c.set_override(-5.0, "");
        assert_eq!(c.aggregate_score(), 0.0);
    }

    #[test]
    fn pass_status_uses_threshold() {
        let c = scored(&[(CaseId::GoldenPath, 50.0), (CaseId::EdgeCase, 49.9)]);
        let status = c.pass_status(DEFAULT_PASS_THRESHOLD);
        assert_eq!(status[&CaseId::GoldenPath], true);
        assert_eq!(status[&CaseId::EdgeCase], false);
        assert!(!status.contains_key(&CaseId::Adversarial));
    }

    #[test]
    fn engine_names_parse() {
        for kind in EngineKind::ALL {
            assert_eq!(kind.as_str().parse::<EngineKind>().unwrap(), kind);
        }
        assert_eq!("Context_Filter".parse::<EngineKind>().unwrap(), EngineKind::ContextFilter);
        assert!("genetic".parse::<EngineKind>().is_err());
    }

    #[test]
    fn engine_serializes_with_stable_name() {
        let json = serde_json::to_string(&EngineKind::ContextFilter).unwrap();
        assert_eq!(json, "\"context-filter\"");
    }

    #[test]
    fn strategy_extra_is_tagged() {
        let extra = StrategyExtra::Iterative {
            generation_reasoning: "shorter".to_string(),
        };
        let value = serde_json::to_value(&extra).unwrap();
        assert_eq!(value["strategy"], "iterative");
        assert_eq!(value["generation_reasoning"], "shorter");
    }

    #[test]
    fn preview_truncates_on_chars() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("abcdefghij", 4), "abcd...");
        assert_eq!(preview("ééééé", 2), "éé...");
    }
}
