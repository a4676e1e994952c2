//! Config command handler.

use std::path::Path;

use memdedup::config::EngineConfig;

/// Prints the effective configuration (file, then environment overrides).
pub fn cmd_config(config: &EngineConfig, explicit: Option<&Path>) -> anyhow::Result<()> {
    match explicit.map(Path::to_path_buf).or_else(EngineConfig::default_path) {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# No config file found; defaults plus environment overrides"),
    }
    print!("{}", config.to_toml()?);
    Ok(())
}
