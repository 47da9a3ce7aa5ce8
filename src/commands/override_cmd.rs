use anyhow::{Context, Result};
use std::path::Path;

/// Set or clear a human override on a candidate in a saved session.
pub fn run(path: &Path, id: &str, score: Option<f64>, reason: Option<&str>, clear: bool) -> Result<()> {
    let mut session = super::load_session(path)?;

    if clear {
        session
            .clear_override(id)
            .with_context(|| format!("Cannot clear override on '{}'", id))?;
        println!("Cleared override on {}", id);
    } else {
        let Some(score) = score else {
            anyhow::bail!("A score is required unless --clear is given");
        };
        session
            .override_score(id, score, reason.unwrap_or("Manual review"))
            .with_context(|| format!("Cannot override '{}'", id))?;
        println!("Override applied to {}: {:.1}", id, score.clamp(0.0, 100.0));
    }

    let candidate = session
        .candidate(id)
        .context("Candidate disappeared after override")?;
    println!(
        "Aggregate score now {:.1} (judge {:.1})",
        candidate.aggregate_score(),
        candidate.judge_score()
    );
    if let Some(winner) = session.winner() {
        println!("Winner: {} ({:.1})", winner.id, winner.aggregate_score());
    }

    session
        .save(path)
        .with_context(|| format!("Failed to save session '{}'", path.display()))?;
    Ok(())
}
