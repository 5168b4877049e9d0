//! `chatline config` — Configuration management commands.

use chatline_config::AppConfig;
use std::path::Path;

pub fn print_default() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", AppConfig::default_toml());
    Ok(())
}

pub fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating {}", path.display());

    match AppConfig::load_with_env(path) {
        Ok(config) => {
            println!("   Config parsed successfully");

            let mut warnings = Vec::new();
            if !config.has_api_key() && config.model.provider != "ollama" {
                warnings.push("No API key set (set CHATLINE_API_KEY or OPENAI_API_KEY)");
            }
            if config.context.threshold < config.context.window {
                warnings.push("context.threshold < context.window: summaries will overlap the recent window");
            }
            if config.database.url.contains(":memory:") {
                warnings.push("database.url is in-memory: nothing survives the process");
            }

            if warnings.is_empty() {
                println!("   All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   warning: {w}");
                }
            }

            println!();
            println!("   Database:  {}", config.database.url);
            println!("   Cache:     {:?} (max {} per session)", config.cache.backend, config.cache.max_len);
            println!("   Queue:     {:?} ({} -> {})", config.queue.backend, config.queue.topic, config.queue.dlq_topic);
            println!("   Model:     {} / {}", config.model.provider, config.model.model);
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub fn show(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load_with_env(path).map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub fn path(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", path.display());
    Ok(())
}
