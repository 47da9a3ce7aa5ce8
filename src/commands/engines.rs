use anyhow::Result;
use serde::Serialize;

#[derive(Serialize)]
struct EngineInfo {
    name: &'static str,
    description: &'static str,
}

pub fn run(json: bool) -> Result<()> {
    let engines: Vec<EngineInfo> = promptopt::registry::engines()
        .into_iter()
        .map(|(name, description)| EngineInfo { name, description })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&engines)?);
        return Ok(());
    }

    for engine in &engines {
        println!("{:<16} {}", engine.name, engine.description);
    }
    Ok(())
}
