//! The optimization session: seed, configuration, test bench, candidates
//! and the best-score-per-step trajectory.
//!
//! The session is the only shared mutable object in a run. The control loop
//! and the active strategy write to it; observers read snapshots. Candidates
//! and trajectory entries are append-only through [`Session::push_candidate`]
//! and [`Session::push_trajectory`], which enforce ordering.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::candidate::{preview, CaseId, Candidate, EngineKind};

pub const SESSION_FORMAT_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to access session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid session JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no candidate with id '{0}'")]
    UnknownCandidate(String),

    #[error("trajectory step {step} must be greater than the last recorded step {last}")]
    TrajectoryOrder { step: u32, last: u32 },

    #[error("candidate generation {generation} is behind the last appended generation {last}")]
    GenerationOrder { generation: u32, last: u32 },
}

/// Run parameters shared by every engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model the session was run against; sessions built from a config
    /// take it from the client.
    #[serde(default = "default_model")]
    pub model: String,

    /// Temperature for executing candidate prompts.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_candidates_per_step")]
    pub candidates_per_step: usize,

    /// Stop once any candidate's aggregate score reaches this.
    #[serde(default = "default_stop_score_threshold")]
    pub stop_score_threshold: f64,

    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_candidates_per_step() -> usize {
    3
}

fn default_stop_score_threshold() -> f64 {
    95.0
}

fn default_max_steps() -> u32 {
    10
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            candidates_per_step: default_candidates_per_step(),
            stop_score_threshold: default_stop_score_threshold(),
            max_steps: default_max_steps(),
        }
    }
}

/// The fixed three-case evaluation set. Empty cases are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestBench {
    #[serde(default)]
    pub golden_path: String,
    #[serde(default)]
    pub edge_case: String,
    #[serde(default)]
    pub adversarial: String,
}

impl TestBench {
    pub fn new(
        golden_path: impl Into<String>,
        edge_case: impl Into<String>,
        adversarial: impl Into<String>,
    ) -> Self {
        TestBench {
            golden_path: golden_path.into(),
            edge_case: edge_case.into(),
            adversarial: adversarial.into(),
        }
    }

    pub fn input(&self, case: CaseId) -> &str {
        match case {
            CaseId::GoldenPath => &self.golden_path,
            CaseId::EdgeCase => &self.edge_case,
            CaseId::Adversarial => &self.adversarial,
        }
    }

    /// Cases with non-blank input, in bench order.
    pub fn active_cases(&self) -> Vec<(CaseId, &str)> {
        CaseId::ALL
            .into_iter()
            .map(|case| (case, self.input(case)))
            .filter(|(_, input)| !input.trim().is_empty())
            .collect()
    }
}

/// Best candidate of one completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    pub step: u32,
    pub score: f64,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
}

/// Coarse progress tag for observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Optimization,
    Mutation,
    Evaluation,
    Induction,
    Growth,
    Filtering,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Optimization => "optimization",
            Phase::Mutation => "mutation",
            Phase::Evaluation => "evaluation",
            Phase::Induction => "induction",
            Phase::Growth => "growth",
            Phase::Filtering => "filtering",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_used: Option<EngineKind>,
    pub created_at: DateTime<Utc>,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        SessionMetadata {
            session_id: Uuid::new_v4().to_string(),
            version: SESSION_FORMAT_VERSION.to_string(),
            engine_used: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub metadata: SessionMetadata,
    pub seed_prompt: String,
    #[serde(default)]
    pub config: RunConfig,
    #[serde(default)]
    pub test_bench: TestBench,
    #[serde(default)]
    pub current_step: u32,
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    trajectory: Vec<TrajectoryEntry>,
    /// Id of the current best candidate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    winner: Option<String>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub active_node: String,
    #[serde(default)]
    pub narration: String,
}

impl Session {
    pub fn new(seed_prompt: impl Into<String>, config: RunConfig, test_bench: TestBench) -> Self {
        Session {
            metadata: SessionMetadata::default(),
            seed_prompt: seed_prompt.into(),
            config,
            test_bench,
            current_step: 0,
            candidates: Vec::new(),
            trajectory: Vec::new(),
            winner: None,
            phase: Phase::Idle,
            active_node: String::new(),
            narration: String::new(),
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn trajectory(&self) -> &[TrajectoryEntry] {
        &self.trajectory
    }

    pub fn candidate(&self, id: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.candidate(id).is_some()
    }

    /// True if a candidate with this exact text and generation already exists.
    pub fn is_duplicate(&self, full_text: &str, generation_index: u32) -> bool {
        self.candidates
            .iter()
            .any(|c| c.generation_index == generation_index && c.full_text == full_text)
    }

    /// Highest aggregate score; the earliest candidate wins ties.
    pub fn best_candidate(&self) -> Option<&Candidate> {
        let mut best: Option<&Candidate> = None;
        for candidate in &self.candidates {
            match best {
                Some(b) if candidate.aggregate_score() <= b.aggregate_score() => {}
                _ => best = Some(candidate),
            }
        }
        best
    }

    pub fn best_score(&self) -> f64 {
        self.best_candidate().map(Candidate::aggregate_score).unwrap_or(0.0)
    }

    pub fn winner(&self) -> Option<&Candidate> {
        self.winner.as_deref().and_then(|id| self.candidate(id))
    }

    /// Candidates sorted by aggregate score, best first.
    pub fn ranked(&self) -> Vec<&Candidate> {
        let mut ranked: Vec<&Candidate> = self.candidates.iter().collect();
        ranked.sort_by(|a, b| b.aggregate_score().total_cmp(&a.aggregate_score()));
        ranked
    }

    pub fn push_candidate(&mut self, candidate: Candidate) -> Result<(), SessionError> {
        if let Some(last) = self.candidates.last() {
            if candidate.generation_index < last.generation_index {
                return Err(SessionError::GenerationOrder {
                    generation: candidate.generation_index,
                    last: last.generation_index,
                });
            }
        }
        self.candidates.push(candidate);
        self.refresh_winner();
        Ok(())
    }

    pub fn push_trajectory(&mut self, entry: TrajectoryEntry) -> Result<(), SessionError> {
        if let Some(last) = self.trajectory.last() {
            if entry.step <= last.step {
                return Err(SessionError::TrajectoryOrder {
                    step: entry.step,
                    last: last.step,
                });
            }
        }
        self.trajectory.push(entry);
        Ok(())
    }

    /// Append the trajectory entry for `step` from that step's best candidate.
    pub fn record_step_best(&mut self, step: u32, best: &Candidate) -> Result<(), SessionError> {
        self.push_trajectory(TrajectoryEntry {
            step,
            score: best.aggregate_score(),
            prompt: best.full_text.clone(),
            timestamp: Utc::now(),
        })
    }

    /// Compact history of the last `n` steps for meta-prompts.
    pub fn trajectory_summary(&self, n: usize) -> String {
        if self.trajectory.is_empty() {
            return format!("[Initial seed: {} | Score: N/A]", preview(&self.seed_prompt, 100));
        }
        let start = self.trajectory.len().saturating_sub(n);
        self.trajectory[start..]
            .iter()
            .map(|e| format!("[Prompt: {} | Score: {:.1}]", preview(&e.prompt, 50), e.score))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn override_score(
        &mut self,
        id: &str,
        score: f64,
        reasoning: impl Into<String>,
    ) -> Result<(), SessionError> {
        let candidate = self
            .candidates
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SessionError::UnknownCandidate(id.to_string()))?;
        candidate.set_override(score, reasoning);
        self.refresh_winner();
        Ok(())
    }

    pub fn clear_override(&mut self, id: &str) -> Result<(), SessionError> {
        let candidate = self
            .candidates
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SessionError::UnknownCandidate(id.to_string()))?;
        candidate.clear_override();
        self.refresh_winner();
        Ok(())
    }

    pub fn set_phase(&mut self, phase: Phase, active_node: &str) {
        self.phase = phase;
        self.active_node = active_node.to_string();
    }

    pub fn narrate(&mut self, text: impl Into<String>) {
        self.narration = text.into();
    }

    /// Drop all results and return to a fresh, idle state.
    pub fn reset(&mut self) {
        self.current_step = 0;
        self.candidates.clear();
        self.trajectory.clear();
        self.winner = None;
        self.phase = Phase::Idle;
        self.active_node.clear();
        self.narration.clear();
    }

    fn refresh_winner(&mut self) {
        self.winner = self.best_candidate().map(|c| c.id.clone());
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let mut session: Session = serde_json::from_str(json)?;
        for candidate in &mut session.candidates {
            candidate.recompute();
        }
        session.refresh_winner();
        Ok(session)
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| SessionError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        fs::write(path, self.to_json()?).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = fs::read_to_string(path).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }
}
