//! Configuration view and validation: `reqforge config`.

use std::path::Path;

use anyhow::{Result, bail};
use reqforge::config::Config;

use super::super::ConfigCommands;

pub fn cmd_config(path: &Path, config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if path.exists() {
                println!("# Config file: {}", path.display());
            } else {
                println!("# No config file at {}; using defaults", path.display());
            }
            println!("# Effective values (with env overrides)");
            println!();

            let mut shown = config.clone();
            if shown.encrypt.aes_key.is_some() {
                shown.encrypt.aes_key = Some("***".to_string());
            }
            print!("{}", shown.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if !problems.is_empty() {
                for problem in &problems {
                    eprintln!("  - {}", problem);
                }
                bail!("{} configuration problem(s) found", problems.len());
            }
            println!("Configuration is valid.");
        }
    }
    Ok(())
}
