use anyhow::{Context, Result};
use promptopt::candidate::{EngineKind, preview};
use promptopt::client::InferenceBackend;
use promptopt::config::{Config, PROJECT_DIR};
use promptopt::judge::{Evaluator, HumanOverrideJudge, LlmJudge};
use promptopt::optimizer::{RunEvent, StepResult};
use promptopt::registry;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn run(
    config: &Config,
    engine: &str,
    steps: Option<u32>,
    out: Option<&Path>,
    json: bool,
) -> Result<()> {
    let kind: EngineKind = engine.parse().with_context(|| {
        let names: Vec<&str> = EngineKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("Valid engines: {}", names.join(", "))
    })?;
    let max_steps = steps.unwrap_or(config.run.max_steps);

    let client = super::connect(config)?;
    let backend: Arc<dyn InferenceBackend> = client;
    let judge: Arc<dyn Evaluator> = Arc::new(HumanOverrideJudge::new(LlmJudge::new(backend.clone())));
    let optimizer = registry::build_optimizer(kind, config, backend, judge);

    if !json {
        println!("Engine: {} ({})", kind, kind.description());
        println!("Steps:  up to {}", max_steps);
        println!();
    }

    let handle = optimizer.run_async(max_steps);
    for event in handle.events().iter() {
        match event {
            RunEvent::Step(result) => {
                if json {
                    println!("{}", serde_json::to_string(&step_json(&result))?);
                } else {
                    print_step(&result);
                }
            }
            RunEvent::Status(status) => {
                if !json {
                    println!("[status] {}", status);
                }
            }
        }
    }

    let optimizer = handle.join()?;
    let snapshot = optimizer.current_status();
    let session = optimizer.into_session();

    let path = match out {
        Some(p) => p.to_path_buf(),
        None => default_session_path(&session.metadata.session_id),
    };
    session
        .save(&path)
        .with_context(|| format!("Failed to save session to '{}'", path.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!();
        println!("Finished: {} after {} step(s)", snapshot.status, snapshot.step);
        if let Some(err) = &snapshot.last_error {
            println!("Last error: {}", err);
        }
        match session.best_candidate() {
            Some(best) => {
                println!("Best score: {:.1}", best.aggregate_score());
                println!("Best prompt:\n{}", best.full_text);
            }
            None => println!("No candidates were produced."),
        }
        println!("Session saved to {}", path.display());
    }
    Ok(())
}

fn default_session_path(session_id: &str) -> PathBuf {
    PathBuf::from(PROJECT_DIR)
        .join("sessions")
        .join(format!("{}.json", session_id))
}

fn step_json(result: &StepResult) -> serde_json::Value {
    serde_json::json!({
        "step": result.step_number,
        "phase": result.phase,
        "candidates": result.candidates.len(),
        "best_score": result.best_candidate.as_ref().map(|c| c.aggregate_score()),
        "should_stop": result.should_stop,
        "error": result.error,
    })
}

fn print_step(result: &StepResult) {
    println!("Step {}: {} candidate(s)", result.step_number, result.candidates.len());
    if let Some(best) = &result.best_candidate {
        println!("  best {:.1}  {}", best.aggregate_score(), preview(&best.display_text, 70));
    }
    if let Some(err) = &result.error {
        println!("  error: {}", err);
    }
    if result.should_stop {
        println!("  engine finished");
    }
}
