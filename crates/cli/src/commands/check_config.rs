//! check-config CLI command.

use anyhow::{Context, Result};

use super::load_config;

/// Loads and validates the config, then prints it as JSON.
///
/// # Errors
/// Returns an error if the file cannot be parsed or fails validation.
pub fn run_check_config(path: &str, profile: Option<&str>) -> Result<()> {
    let config = load_config(path, profile)
        .with_context(|| format!("invalid configuration in {path}"))?;

    let storage = if config.database.url.is_some() {
        "postgres"
    } else {
        "memory"
    };
    tracing::info!(
        path,
        profile = profile.unwrap_or("-"),
        storage,
        timezone = %config.session.timezone,
        "Configuration is valid"
    );

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
