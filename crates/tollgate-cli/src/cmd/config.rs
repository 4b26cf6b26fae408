use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use tollgate_core::config::{GateConfig, WarnLevel};
use tollgate_core::paths;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective gate configuration
    Show,

    /// Validate the gate configuration for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<i32> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

fn load(root: &Path) -> anyhow::Result<GateConfig> {
    GateConfig::load(root).with_context(|| {
        format!(
            "failed to load {}",
            paths::gate_config_path(root).display()
        )
    })
}

fn show(root: &Path, json: bool) -> anyhow::Result<i32> {
    let config = load(root)?;
    if json {
        print_json(&config)?;
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(0)
}

fn validate(root: &Path, json: bool) -> anyhow::Result<i32> {
    let config = load(root)?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Gate config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("gate config validation found errors");
    }
    Ok(0)
}
