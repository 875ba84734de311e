//! Configuration view and validation commands: `delve config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    use delve::config::{CONFIG_FILE, DELVE_DIR, DelveToml};

    let delve_dir = project_dir.join(DELVE_DIR);
    let config_path = delve_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Delve Configuration");
            println!("===================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                DelveToml::load(&config_path)?
            } else {
                println!("No delve.toml found at {}", config_path.display());
                println!("Using default configuration.");
                DelveToml::default()
            };
            println!();

            let p = &toml.pipeline;
            println!("[pipeline]");
            println!("  max_rounds = {}", p.max_rounds);
            println!("  max_tasks_per_round = {}", p.max_tasks_per_round);
            println!("  max_tasks_per_session = {}", p.max_tasks_per_session);
            println!("  coverage_target_percent = {}", p.coverage_target_percent);
            println!("  diminishing_returns_round = {}", p.diminishing_returns_round);
            println!("  round_timeout_secs = {}", p.round_timeout_secs);
            println!("  max_brief_revisions = {}", p.max_brief_revisions);
            println!();

            println!("[store]");
            if let Some(dir) = &toml.store.dir {
                println!("  dir = \"{}\"", dir.display());
            }
            println!(
                "  max_concurrent_sessions = {}",
                toml.store.max_concurrent_sessions
            );
            println!();

            let cb = &toml.circuit_breaker;
            println!("[circuit_breaker]");
            println!("  failure_threshold = {}", cb.failure_threshold);
            println!("  recovery_timeout_secs = {}", cb.recovery_timeout_secs);
            println!("  half_open_max_calls = {}", cb.half_open_max_calls);
            println!();

            println!("[retry]");
            for (class, r) in toml.retry_policy().classes() {
                println!(
                    "  {:<12} attempts={} base={}ms max={}ms rate_limit={}ms",
                    class, r.max_attempts, r.base_delay_ms, r.max_delay_ms, r.rate_limit_delay_ms
                );
            }
            println!();

            // Show effective values (including env overrides)
            let effective = toml.clone().with_env()?;
            println!("Effective values (with env overrides):");
            println!("  max_rounds = {}", effective.pipeline.max_rounds);
            println!(
                "  round_timeout_secs = {}",
                effective.pipeline.round_timeout_secs
            );
            println!(
                "  store dir = \"{}\"",
                effective.store_dir(project_dir).display()
            );
            println!();

            if !config_path.exists() {
                println!("Run 'delve config init' to create a delve.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No delve.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = DelveToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("delve.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !delve_dir.exists() {
                std::fs::create_dir_all(&delve_dir)?;
            }

            DelveToml::default().save(&config_path)?;

            println!("Created delve.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [pipeline] round and task quotas, coverage target, round timeout");
            println!("  - [circuit_breaker] failure threshold and recovery timeout");
            println!("  - [retry.<class>] backoff per operation class");
            println!();
        }
    }

    Ok(())
}
