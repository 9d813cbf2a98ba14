//! Configuration view and init commands (`tasker config`).

use anyhow::Result;
use serde_json::json;
use tasker::config::Config;

use super::Output;
use crate::ConfigCommands;

pub fn cmd_config(config: &Config, out: &Output, command: Option<&ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => out.emit(config, || {
            println!();
            println!("Tasker Configuration");
            println!("====================");
            println!();
            match &config.config_file {
                Some(path) => println!("Config file: {}", path.display()),
                None => println!("No tasker.toml at {}", config.config_path().display()),
            }
            println!();
            println!("  planning_dir      = \"{}\"", config.planning_dir.display());
            if let Some(target) = &config.target_dir {
                println!("  target_dir        = \"{}\"", target);
            }
            println!("  lock_timeout_secs = {}", config.lock_timeout_secs);
            println!("  max_parallel      = {}", config.max_parallel);
            println!("  log_level         = \"{}\"", config.log_level);
            println!();
            for warning in &config.warnings {
                println!("warning: {}", warning);
            }
        }),
        Some(ConfigCommands::Init) => {
            let path = config.write_file()?;
            out.emit(&json!({ "path": path }), || {
                println!("Created {}", path.display());
            })
        }
    }
}
