//! Instruction induction: deduce the instruction behind worked examples,
//! then resample it into variations each step.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::candidate::{preview, Candidate, EngineKind, StrategyExtra};
use crate::client::Message;
use crate::optimizer::{best_of, StepContext, StepResult, Strategy};
use crate::parsing::parse_numbered_lines;
use crate::prompts::{self, INDUCTION_EXAMPLE, INDUCTION_SYSTEM, INDUCTION_USER_FOOTER, INDUCTION_USER_HEADER, RESAMPLE};
use crate::session::{Phase, Session};

pub const INDUCTION_TEMPERATURE: f64 = 0.3;

/// At most this many examples go into the induction call.
pub const MAX_EXAMPLES: usize = 3;

/// Induction converges quickly; the run ends after this step.
pub const LAST_STEP: u32 = 3;

/// A worked (input, output) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub input: String,
    pub output: String,
}

impl Example {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Example {
            input: input.into(),
            output: output.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct InductionStrategy {
    examples: Vec<Example>,
    instruction: Option<String>,
    deduced_from: Vec<usize>,
}

impl InductionStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_examples(mut self, examples: Vec<Example>) -> Self {
        self.set_examples(examples);
        self
    }

    pub fn set_examples(&mut self, examples: Vec<Example>) {
        self.examples = examples;
    }

    /// The deduced instruction, once phase 1 has run.
    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    /// Phase 1. Falls back to the seed prompt with fewer than 2 examples.
    /// An empty string means induction failed.
    fn induce(&mut self, ctx: &StepContext<'_>, session: &Session) -> String {
        if self.examples.len() < 2 {
            info!(examples = self.examples.len(), "too few examples, using seed prompt as instruction");
            self.deduced_from.clear();
            return session.seed_prompt.trim().to_string();
        }

        let used = self.examples.len().min(MAX_EXAMPLES);
        let mut user = String::from(INDUCTION_USER_HEADER);
        for (i, example) in self.examples[..used].iter().enumerate() {
            user.push_str(&prompts::render(
                INDUCTION_EXAMPLE,
                &[
                    ("n", &(i + 1).to_string()),
                    ("input", &example.input),
                    ("output", &example.output),
                ],
            ));
        }
        user.push_str(INDUCTION_USER_FOOTER);

        let conversation = [Message::system(INDUCTION_SYSTEM), Message::user(user)];
        let reply = ctx.call(&conversation, Some(INDUCTION_TEMPERATURE));
        if !reply.success {
            warn!(error = %reply.error_message(), "induction call failed");
            return String::new();
        }
        self.deduced_from = (0..used).collect();
        reply.content.trim().to_string()
    }

    /// Phase 2. Always contains `instruction`, first unless the model
    /// repeated it.
    fn resample(ctx: &StepContext<'_>, session: &Session, instruction: &str) -> Vec<String> {
        let count = session.config.candidates_per_step;
        let user = prompts::render(
            RESAMPLE,
            &[("instruction", instruction), ("count", &count.to_string())],
        );
        let reply = ctx.call(&[Message::user(user)], Some(session.config.temperature));
        if !reply.success {
            warn!(error = %reply.error_message(), "resampling failed, using the deduced instruction only");
            return vec![instruction.to_string()];
        }

        let mut variations = parse_numbered_lines(&reply.content);
        if !variations.iter().any(|v| v == instruction) {
            variations.insert(0, instruction.to_string());
        }
        variations.truncate(count + 1);
        variations
    }
}

impl Strategy for InductionStrategy {
    fn kind(&self) -> EngineKind {
        EngineKind::Induction
    }

    fn step(&mut self, ctx: &StepContext<'_>, session: &mut Session) -> Result<StepResult> {
        let step = session.current_step;

        let instruction = match self.instruction.clone() {
            Some(instruction) => instruction,
            None => {
                session.set_phase(Phase::Induction, "induction");
                session.narrate(format!(
                    "[Induction]\nExamples analyzed: {}\nDeducing the hidden instruction...",
                    self.examples.len().min(MAX_EXAMPLES)
                ));
                let deduced = self.induce(ctx, session);
                if deduced.is_empty() {
                    session.set_phase(Phase::Idle, "");
                    session.narrate("Induction failed - no instruction deduced");
                    return Ok(StepResult::new(session, Vec::new(), true)
                        .with_error("Induction failed: no instruction deduced"));
                }
                self.instruction = Some(deduced.clone());
                deduced
            }
        };

        session.set_phase(Phase::Mutation, "induction");
        session.narrate(format!(
            "[Induction]\nDeduced instruction: \"{}\"\nGenerating {} variations...",
            preview(&instruction, 50),
            session.config.candidates_per_step
        ));
        let variations = Self::resample(ctx, session, &instruction);

        session.set_phase(Phase::Evaluation, "candidates");
        let mut scored = Vec::new();
        for text in variations {
            if ctx.stop_requested() {
                info!(step, "stop requested, skipping remaining evaluations");
                break;
            }
            let is_original = text == instruction;
            let mut candidate = Candidate::new(EngineKind::Induction, step, text)
                .with_extra(StrategyExtra::Induction {
                    deduced_from: self.deduced_from.clone(),
                    is_original,
                });
            candidate.display_text = format!("Instruction: {}", candidate.full_text);
            ctx.score_candidate(&mut candidate, session);
            session.push_candidate(candidate.clone())?;
            scored.push(candidate);
        }

        if let Some(best) = best_of(&scored) {
            session.record_step_best(step, best)?;
        }

        session.set_phase(Phase::Idle, "");
        Ok(StepResult::new(session, scored, step >= LAST_STEP))
    }

    fn reset(&mut self) {
        self.instruction = None;
        self.deduced_from.clear();
    }
}
