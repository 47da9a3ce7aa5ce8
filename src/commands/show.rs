use anyhow::Result;
use promptopt::candidate::{CaseId, DEFAULT_PASS_THRESHOLD, preview};
use promptopt::session::Session;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// JSON output structure for one ranked candidate
#[derive(Debug, Serialize)]
struct CandidateRow {
    rank: usize,
    id: String,
    step: u32,
    score: f64,
    judge_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    override_reason: Option<String>,
    cases: BTreeMap<CaseId, f64>,
    pass: BTreeMap<CaseId, bool>,
    prompt: String,
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    engine: Option<String>,
    seed_prompt: String,
    steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    winner: Option<String>,
    candidates: Vec<CandidateRow>,
    trajectory: Vec<(u32, f64)>,
}

fn summarize(session: &Session) -> SessionSummary {
    let candidates = session
        .ranked()
        .into_iter()
        .enumerate()
        .map(|(i, c)| CandidateRow {
            rank: i + 1,
            id: c.id.clone(),
            step: c.generation_index,
            score: c.aggregate_score(),
            judge_score: c.judge_score(),
            override_reason: c.human_override().map(|o| o.reasoning.clone()),
            cases: c.per_case_scores().clone(),
            pass: c.pass_status(DEFAULT_PASS_THRESHOLD),
            prompt: c.full_text.clone(),
        })
        .collect();

    SessionSummary {
        session_id: session.metadata.session_id.clone(),
        engine: session.metadata.engine_used.map(|e| e.to_string()),
        seed_prompt: session.seed_prompt.clone(),
        steps: session.current_step,
        winner: session.winner().map(|c| c.id.clone()),
        candidates,
        trajectory: session.trajectory().iter().map(|e| (e.step, e.score)).collect(),
    }
}

pub fn run(path: &Path, json: bool) -> Result<()> {
    let session = super::load_session(path)?;
    let summary = summarize(&session);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_human_readable(&summary);
    }

    Ok(())
}

fn print_human_readable(summary: &SessionSummary) {
    println!("Session: {}", summary.session_id);
    if let Some(ref engine) = summary.engine {
        println!("Engine: {}", engine);
    }
    println!("Steps: {}", summary.steps);
    println!("Seed: {}", preview(&summary.seed_prompt, 80));

    if summary.candidates.is_empty() {
        println!("\nNo candidates.");
        return;
    }

    println!("\nCandidates ({}):", summary.candidates.len());
    for row in &summary.candidates {
        let marker = if summary.winner.as_deref() == Some(row.id.as_str()) {
            "*"
        } else {
            " "
        };
        let lights: String = row
            .pass
            .iter()
            .map(|(case, ok)| format!("{}:{}", case.label(), if *ok { "pass" } else { "fail" }))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{}{:>3}. {:>5.1}  step {:<3} {}  [{}]",
            marker,
            row.rank,
            row.score,
            row.step,
            &row.id[..row.id.len().min(8)],
            lights
        );
        if let Some(ref reason) = row.override_reason {
            println!("       override (judge said {:.1}): {}", row.judge_score, reason);
        }
        println!("       {}", preview(&row.prompt, 90));
    }

    if !summary.trajectory.is_empty() {
        println!("\nTrajectory:");
        for (step, score) in &summary.trajectory {
            println!("  step {:<3} {:.1}", step, score);
        }
    }
}
