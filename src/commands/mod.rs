pub mod engines;
pub mod health;
pub mod override_cmd;
pub mod run;
pub mod show;

use anyhow::{Context, Result};
use promptopt::client::RemoteClient;
use promptopt::config::Config;
use promptopt::session::Session;
use std::path::Path;
use std::sync::Arc;

/// Load a saved session file.
pub fn load_session(path: &Path) -> Result<Session> {
    if !path.exists() {
        anyhow::bail!("Session file '{}' not found", path.display());
    }
    Session::load(path).with_context(|| format!("Failed to load session '{}'", path.display()))
}

/// Build the gateway client from config. Fails when the credential is missing.
pub fn connect(config: &Config) -> Result<Arc<RemoteClient>> {
    let client = RemoteClient::from_config(config.client.clone()).with_context(|| {
        format!(
            "Could not create the inference client (set {} to the base64 credential)",
            config.client.credential_env
        )
    })?;
    Ok(Arc::new(client))
}
