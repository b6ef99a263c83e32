//! Configuration loading and schema definitions for drover.
//!
//! Configuration lives in a TOML file, `drover.toml` by default. See
//! [`schema`] for every section and its defaults.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail};

/// Loads drover configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema or fails validation
///
/// # Example
///
/// ```no_run
/// use drover::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("drover.toml"))?;
/// println!("Max workers: {}", config.drover.max_workers);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate(&config).with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads drover configuration from a TOML string.
///
/// # Example
///
/// ```
/// use drover::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [drover]
///     max_workers = 2
///     run_command = "pytest {test_id}"
/// "#)?;
///
/// assert_eq!(config.drover.max_workers, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate(&config)?;
    Ok(config)
}

/// Checks constraints the schema alone cannot express.
fn validate(config: &Config) -> Result<()> {
    if config.drover.max_workers == 0 {
        bail!("drover.max_workers must be at least 1");
    }
    if let Some(template) = &config.drover.run_command {
        crate::job::CommandTemplate::parse(template.as_str())
            .context("drover.run_command is not a valid runner template")?;
    }
    for (name, workspace) in &config.workspaces {
        if let Some(template) = &workspace.run_command {
            crate::job::CommandTemplate::parse(template.as_str()).with_context(|| {
                format!("workspaces.{}.run_command is not a valid runner template", name)
            })?;
        }
        for resource in &workspace.resources {
            if resource.kind.is_empty()
                || !resource
                    .kind
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                bail!(
                    "workspaces.{}: resource kind {:?} must be non-empty [A-Za-z0-9_]",
                    name,
                    resource.kind
                );
            }
        }
    }
    Ok(())
}
