//! Engine registry: stable names to configured strategies.

use std::sync::Arc;

use crate::candidate::EngineKind;
use crate::client::InferenceBackend;
use crate::config::Config;
use crate::judge::Evaluator;
use crate::optimizer::{Optimizer, Strategy};
use crate::strategies::{ContextFilterStrategy, EvolutionaryStrategy, InductionStrategy, IterativeStrategy};

/// A strategy for `kind`, configured from `config`.
pub fn build(kind: EngineKind, config: &Config) -> Box<dyn Strategy> {
    match kind {
        EngineKind::Iterative => Box::new(IterativeStrategy::new()),
        EngineKind::Induction => Box::new(InductionStrategy::new().with_examples(config.examples.clone())),
        EngineKind::Evolutionary => {
            let mut strategy = EvolutionaryStrategy::new()
                .with_population_size(config.evolution.population_size)
                .with_max_generations(config.evolution.max_generations);
            if let Some(seed) = config.evolution.rng_seed {
                strategy = strategy.with_seed(seed);
            }
            Box::new(strategy)
        }
        EngineKind::ContextFilter => {
            let mut strategy = ContextFilterStrategy::new();
            match (&config.context.raw, &config.context.query) {
                (Some(raw), query) => {
                    let query = query.clone().unwrap_or_else(|| config.seed_prompt.clone());
                    strategy.set_context(raw.clone(), query);
                }
                (None, Some(query)) => strategy.set_query(query.clone()),
                (None, None) => {}
            }
            Box::new(strategy)
        }
    }
}

/// A ready-to-run optimizer over a fresh session from `config`.
pub fn build_optimizer(
    kind: EngineKind,
    config: &Config,
    backend: Arc<dyn InferenceBackend>,
    judge: Arc<dyn Evaluator>,
) -> Optimizer {
    Optimizer::new(build(kind, config), config.new_session(), backend, judge)
}

/// `(name, description)` for every engine, in display order.
pub fn engines() -> Vec<(&'static str, &'static str)> {
    EngineKind::ALL
        .iter()
        .map(|k| (k.as_str(), k.description()))
        .collect()
}
