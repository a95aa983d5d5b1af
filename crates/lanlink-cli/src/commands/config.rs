//! Config command implementation.

use anyhow::{Context, Result};

use lanlink_core::config::Config;

use super::ConfigArgs;

/// Run the config command.
pub fn run(args: &ConfigArgs) -> Result<()> {
    let path = args.config.clone().unwrap_or_else(Config::config_path);

    if args.path {
        println!("{}", path.display());
        return Ok(());
    }

    if args.init && !path.exists() {
        let mut config = Config::default();
        config.ensure_identity();
        config
            .save_to(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote default configuration to {}", path.display());
    }

    let mut config = Config::load_from(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config
        .apply_env()
        .context("Invalid LANLINK_* environment override")?;

    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("# {}", path.display());
    println!("{rendered}");
    Ok(())
}
