use anyhow::Result;
use promptopt::config::Config;

pub fn run(config: &Config) -> Result<()> {
    let client = super::connect(config)?;
    println!("Gateway: {}", client.config().url());
    println!("Model:   {}", client.config().model);

    let status = client.health_check();
    println!("Status:  {}", status);
    if status != "OK" {
        anyhow::bail!("Health check failed");
    }
    Ok(())
}
