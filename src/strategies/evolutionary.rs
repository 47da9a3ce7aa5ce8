//! Evolutionary population search.
//!
//! A fixed-size population of units (task prompt + mutation prompt) is
//! scored, halved by fitness, and refilled with one child per survivor.
//! Fitness uses a single test case to bound the number of backend calls.

use std::collections::HashMap;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::candidate::{preview, CaseDetail, CaseId, Candidate, EngineKind, Operator, StrategyExtra};
use crate::client::Message;
use crate::optimizer::{best_of, StepContext, StepResult, Strategy};
use crate::prompts::{self, CROSSOVER, FIRST_ORDER, MUTATION_DIRECTIONS, MUTATION_PROMPTS, ZERO_ORDER};
use crate::session::{Phase, Session};

pub const DEFAULT_POPULATION_SIZE: usize = 8;
pub const DEFAULT_MAX_GENERATIONS: u32 = 10;
pub const OPERATOR_TEMPERATURE: f64 = 0.7;

/// Fitness input when the golden-path case is blank.
const FALLBACK_FITNESS_INPUT: &str = "Test input";

const UNIT_ID_LEN: usize = 12;

/// One member of the population. Fitness 0.0 means "not scored yet".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub task_prompt: String,
    pub mutation_prompt: String,
    pub fitness: f64,
    pub generation: u32,
    pub parent_ids: Vec<String>,
    pub operator: Operator,
}

impl Unit {
    pub fn is_scored(&self) -> bool {
        self.fitness != 0.0
    }
}

/// Short SHA-256 over a unit's defining content.
pub fn unit_id(task_prompt: &str, mutation_prompt: &str, generation: u32, seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(mutation_prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(generation.to_le_bytes());
    hasher.update(seq.to_le_bytes());
    let full = format!("{:x}", hasher.finalize());
    full[..UNIT_ID_LEN].to_string()
}

pub struct EvolutionaryStrategy {
    population: Vec<Unit>,
    population_size: usize,
    max_generations: u32,
    generation: u32,
    rng: StdRng,
    seed: Option<u64>,
    next_seq: u64,
}

impl Default for EvolutionaryStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl EvolutionaryStrategy {
    pub fn new() -> Self {
        EvolutionaryStrategy {
            population: Vec::new(),
            population_size: DEFAULT_POPULATION_SIZE,
            max_generations: DEFAULT_MAX_GENERATIONS,
            generation: 0,
            rng: StdRng::from_entropy(),
            seed: None,
            next_seq: 0,
        }
    }

    /// Reproducible operator and mutation-prompt choices.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self.seed = Some(seed);
        self
    }

    pub fn with_population_size(mut self, size: usize) -> Self {
        self.population_size = size.max(2);
        self
    }

    pub fn with_max_generations(mut self, generations: u32) -> Self {
        self.max_generations = generations.max(1);
        self
    }

    /// Start from a given population instead of the seed prompt.
    pub fn with_population(mut self, units: Vec<Unit>) -> Self {
        self.population = units;
        self
    }

    pub fn population(&self) -> &[Unit] {
        &self.population
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    fn next_unit(
        &mut self,
        task_prompt: String,
        mutation_prompt: String,
        parent_ids: Vec<String>,
        operator: Operator,
    ) -> Unit {
        self.next_seq += 1;
        Unit {
            id: unit_id(&task_prompt, &mutation_prompt, self.generation, self.next_seq),
            task_prompt,
            mutation_prompt,
            fitness: 0.0,
            generation: self.generation,
            parent_ids,
            operator,
        }
    }

    fn random_mutation_prompt(&mut self) -> String {
        MUTATION_PROMPTS
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(MUTATION_PROMPTS[0])
            .to_string()
    }

    fn initialize(&mut self, seed_prompt: &str) {
        self.population.clear();
        for i in 0..self.population_size {
            let task_prompt = if i == 0 {
                seed_prompt.to_string()
            } else {
                format!("{}\n\n(Variation {})", seed_prompt, i)
            };
            let mutation_prompt = self.random_mutation_prompt();
            let unit = self.next_unit(task_prompt, mutation_prompt, Vec::new(), Operator::Seed);
            self.population.push(unit);
        }
        debug!(size = self.population.len(), "population initialized");
    }

    fn fitness_input(session: &Session) -> String {
        let golden = session.test_bench.golden_path.trim();
        if golden.is_empty() {
            FALLBACK_FITNESS_INPUT.to_string()
        } else {
            session.test_bench.golden_path.clone()
        }
    }

    /// Score a prompt on the fitness case. Returns the score and detail.
    fn fitness(ctx: &StepContext<'_>, session: &Session, task_prompt: &str) -> (f64, CaseDetail) {
        let input = Self::fitness_input(session);
        match ctx.execute_prompt(task_prompt, &input, session.config.temperature) {
            Ok(response) => {
                let result = ctx.judge.evaluate(task_prompt, &input, &response);
                (
                    result.score,
                    CaseDetail {
                        response,
                        reasoning: result.reasoning,
                    },
                )
            }
            Err(err) => {
                warn!(error = %err, "fitness evaluation failed");
                (
                    0.0,
                    CaseDetail {
                        response: String::new(),
                        reasoning: format!("Error: {}", err),
                    },
                )
            }
        }
    }

    /// Ask the backend for a rewritten prompt; keep `fallback` on failure.
    fn rewrite(ctx: &StepContext<'_>, request: String, fallback: &str) -> String {
        let reply = ctx.call(&[Message::user(request)], Some(OPERATOR_TEMPERATURE));
        let text = reply.content.trim();
        if reply.success && !text.is_empty() {
            text.to_string()
        } else {
            warn!(error = %reply.error_message(), "operator call failed, child keeps parent prompt");
            fallback.to_string()
        }
    }

    fn zero_order(&mut self, ctx: &StepContext<'_>, parent: &Unit) -> Unit {
        let direction = MUTATION_DIRECTIONS
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(MUTATION_DIRECTIONS[0]);
        let request = prompts::render(
            ZERO_ORDER,
            &[("prompt", &parent.task_prompt), ("direction", direction)],
        );
        let task_prompt = Self::rewrite(ctx, request, &parent.task_prompt);
        self.next_unit(
            task_prompt,
            format!("Zero-order: {}", direction),
            vec![parent.id.clone()],
            Operator::ZeroOrder,
        )
    }

    fn first_order(&mut self, ctx: &StepContext<'_>, parent: &Unit) -> Unit {
        let request = prompts::render(
            FIRST_ORDER,
            &[
                ("task_prompt", &parent.task_prompt),
                ("mutation_prompt", &parent.mutation_prompt),
            ],
        );
        let task_prompt = Self::rewrite(ctx, request, &parent.task_prompt);
        let mutation_prompt = self.random_mutation_prompt();
        self.next_unit(
            task_prompt,
            mutation_prompt,
            vec![parent.id.clone()],
            Operator::FirstOrder,
        )
    }

    fn crossover(&mut self, ctx: &StepContext<'_>, parent: &Unit, pool: &[Unit]) -> Unit {
        let partners: Vec<&Unit> = pool
            .iter()
            .filter(|u| u.id != parent.id && u.is_scored())
            .collect();
        let Some(other) = partners.choose(&mut self.rng).copied() else {
            debug!(parent = %parent.id, "no crossover partner, using zero-order");
            return self.zero_order(ctx, parent);
        };

        let request = prompts::render(
            CROSSOVER,
            &[
                ("prompt_a", &parent.task_prompt),
                ("score_a", &format!("{:.1}", parent.fitness)),
                ("prompt_b", &other.task_prompt),
                ("score_b", &format!("{:.1}", other.fitness)),
            ],
        );
        let task_prompt = Self::rewrite(ctx, request, &parent.task_prompt);
        self.next_unit(
            task_prompt,
            other.mutation_prompt.clone(),
            vec![parent.id.clone(), other.id.clone()],
            Operator::Crossover,
        )
    }

    fn mirror(&self, unit: &Unit, detail: CaseDetail, step: u32) -> Candidate {
        let mut candidate = Candidate::new(EngineKind::Evolutionary, step, unit.task_prompt.clone())
            .with_id(unit.id.clone())
            .with_display_text(preview(&unit.task_prompt, 80))
            .with_extra(StrategyExtra::Evolutionary {
                unit_id: unit.id.clone(),
                parent_ids: unit.parent_ids.clone(),
                mutation_prompt: unit.mutation_prompt.clone(),
                operator: unit.operator,
                generation: unit.generation,
            });
        candidate.record_case(CaseId::GoldenPath, unit.fitness, detail);
        candidate
    }

    /// Record units not yet in the session. Units that were never scored
    /// (a stop arrived first) wait for a later step.
    fn mirror_new(
        &self,
        units: &[Unit],
        details: &mut HashMap<String, CaseDetail>,
        session: &mut Session,
        step: u32,
    ) -> Result<()> {
        for unit in units {
            if session.contains(&unit.id) {
                continue;
            }
            let detail = match details.remove(&unit.id) {
                Some(detail) => detail,
                None if unit.is_scored() => CaseDetail::default(),
                None => continue,
            };
            session.push_candidate(self.mirror(unit, detail, step))?;
        }
        Ok(())
    }

    fn best_fitness(&self) -> f64 {
        self.population
            .iter()
            .map(|u| u.fitness)
            .fold(0.0, f64::max)
    }

    fn narrate(&self, session: &mut Session, operator: &str, attempting: &str) {
        session.narrate(format!(
            "[Evolutionary - generation {}]\nPopulation size: {}\nOperator: {}\nBest fitness: {:.1}\nAttempting: {}",
            self.generation,
            self.population.len(),
            operator,
            self.best_fitness(),
            attempting
        ));
    }
}

impl Strategy for EvolutionaryStrategy {
    fn kind(&self) -> EngineKind {
        EngineKind::Evolutionary
    }

    fn step(&mut self, ctx: &StepContext<'_>, session: &mut Session) -> Result<StepResult> {
        let step = session.current_step;

        if self.population.is_empty() {
            let seed = session.seed_prompt.clone();
            self.initialize(&seed);
        }
        self.generation += 1;

        // Fitness for every unit still at the sentinel.
        session.set_phase(Phase::Evaluation, "evaluation");
        self.narrate(session, "tournament", "evaluating population fitness");
        let mut details = HashMap::new();
        for i in 0..self.population.len() {
            if ctx.stop_requested() {
                break;
            }
            if !self.population[i].is_scored() {
                let (score, detail) = Self::fitness(ctx, session, &self.population[i].task_prompt);
                self.population[i].fitness = score;
                details.insert(self.population[i].id.clone(), detail);
            }
        }
        let evaluated = self.population.clone();
        self.mirror_new(&evaluated, &mut details, session, step)?;

        // Stable sort: earlier units stay first among equal fitness.
        self.population.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
        let survivors: Vec<Unit> = self.population[..self.population.len() / 2].to_vec();

        session.set_phase(Phase::Growth, "mutation");
        let mut children = Vec::new();
        for survivor in &survivors {
            if ctx.stop_requested() {
                info!(step, "stop requested, skipping remaining offspring");
                break;
            }
            let mut child = match self.rng.gen_range(0..3) {
                0 => self.zero_order(ctx, survivor),
                1 => self.first_order(ctx, survivor),
                _ => self.crossover(ctx, survivor, &evaluated),
            };
            self.narrate(
                session,
                &child.operator.to_string(),
                &format!("{} applied to unit {}", child.operator, survivor.id),
            );
            if !ctx.stop_requested() {
                let (score, detail) = Self::fitness(ctx, session, &child.task_prompt);
                child.fitness = score;
                details.insert(child.id.clone(), detail);
            }
            children.push(child);
        }
        self.mirror_new(&children, &mut details, session, step)?;

        let mut next = survivors;
        next.extend(children);
        next.truncate(self.population_size);
        self.population = next;

        let population: Vec<Candidate> = self
            .population
            .iter()
            .map(|unit| match session.candidate(&unit.id) {
                Some(existing) => existing.clone(),
                None => self.mirror(unit, CaseDetail::default(), step),
            })
            .collect();
        if let Some(best) = best_of(&population) {
            session.record_step_best(step, best)?;
        }

        info!(
            generation = self.generation,
            population = self.population.len(),
            best_fitness = self.best_fitness(),
            "generation complete"
        );
        session.set_phase(Phase::Idle, "");
        Ok(StepResult::new(
            session,
            population,
            self.generation >= self.max_generations,
        ))
    }

    fn reset(&mut self) {
        self.population.clear();
        self.generation = 0;
        self.next_seq = 0;
        if let Some(seed) = self.seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
    }
}
