//! Iterative meta-prompting: each step shows the optimizer model the recent
//! score history and asks for one better prompt.

use anyhow::Result;
use tracing::{info, warn};

use crate::candidate::{Candidate, EngineKind, StrategyExtra};
use crate::client::Message;
use crate::optimizer::{best_of, StepContext, StepResult, Strategy};
use crate::parsing::{parse_variations, VariationSource};
use crate::prompts::{self, ITERATIVE_SYSTEM, ITERATIVE_USER};
use crate::session::{Phase, Session};

/// Trajectory entries shown to the optimizer model.
pub const HISTORY_WINDOW: usize = 5;

/// One variation per step so later steps see the score of every proposal.
const VARIATIONS_PER_STEP: usize = 1;

#[derive(Debug, Default)]
pub struct IterativeStrategy;

impl IterativeStrategy {
    pub fn new() -> Self {
        IterativeStrategy
    }

    fn meta_prompt(session: &Session) -> String {
        let best = if session.trajectory().is_empty() {
            0.0
        } else {
            session.best_score()
        };
        prompts::render(
            ITERATIVE_USER,
            &[
                ("task", &session.seed_prompt),
                ("trajectory", &session.trajectory_summary(HISTORY_WINDOW)),
                ("best_score", &format!("{:.1}", best)),
                ("count", &VARIATIONS_PER_STEP.to_string()),
            ],
        )
    }
}

impl Strategy for IterativeStrategy {
    fn kind(&self) -> EngineKind {
        EngineKind::Iterative
    }

    fn step(&mut self, ctx: &StepContext<'_>, session: &mut Session) -> Result<StepResult> {
        let step = session.current_step;

        session.set_phase(Phase::Mutation, "optimizer");
        session.narrate(format!(
            "[Iterative - step {}]\nHistory: {} entries\nBest score: {:.1}\nProposing a new variation",
            step,
            session.trajectory().len(),
            session.best_score()
        ));

        let conversation = [
            Message::system(ITERATIVE_SYSTEM),
            Message::user(Self::meta_prompt(session)),
        ];
        let reply = ctx.call(&conversation, Some(session.config.temperature));
        if !reply.success {
            warn!(step, error = %reply.error_message(), "variation request failed");
            session.set_phase(Phase::Idle, "");
            session.narrate("Failed to generate variations");
            return Ok(StepResult::new(session, Vec::new(), false).with_error(format!(
                "No variations generated: {}",
                reply.error_message()
            )));
        }

        let (variations, source) = parse_variations(&reply.content, VARIATIONS_PER_STEP);
        if variations.is_empty() {
            session.set_phase(Phase::Idle, "");
            session.narrate("Failed to generate variations");
            return Ok(StepResult::new(session, Vec::new(), false).with_error("No variations generated"));
        }
        if source != VariationSource::Structured {
            info!(step, ?source, "variation grammar not followed, internal parsing fallback used");
        }

        session.set_phase(Phase::Evaluation, "scorer");
        session.narrate(format!(
            "[Iterative - step {}]\nEvaluating {} candidate(s) on the test bench",
            step,
            variations.len()
        ));

        let mut accepted = Vec::new();
        for variation in variations {
            if ctx.stop_requested() {
                info!(step, "stop requested, skipping remaining evaluations");
                break;
            }

            let mut candidate = Candidate::new(EngineKind::Iterative, step, variation.text).with_extra(
                StrategyExtra::Iterative {
                    generation_reasoning: variation.reasoning,
                },
            );
            ctx.score_candidate(&mut candidate, session);

            // A stop during scoring leaves cancelled cases at 0; drop the candidate.
            if ctx.stop_requested() {
                break;
            }

            if session.is_duplicate(&candidate.full_text, candidate.generation_index) {
                warn!(
                    step,
                    generation = candidate.generation_index,
                    "skipping duplicate candidate"
                );
                continue;
            }
            session.push_candidate(candidate.clone())?;
            accepted.push(candidate);
        }

        if let Some(best) = best_of(&accepted) {
            session.record_step_best(step, best)?;
        }

        session.set_phase(Phase::Idle, "");
        session.narrate(match best_of(&accepted) {
            Some(best) => format!("Step {} complete. Best: {:.1}", step, best.aggregate_score()),
            None => format!("Step {} complete. No new candidates", step),
        });
        Ok(StepResult::new(session, accepted, false))
    }
}
