//! `inkwell config`: configuration management commands.

use crate::runtime::load_config;
use inkwell_config::AppConfig;
use std::path::Path;

fn resolve(path: Option<&Path>) -> std::path::PathBuf {
    path.map(Path::to_path_buf).unwrap_or_else(AppConfig::config_path)
}

pub async fn validate(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating {}", resolve(path).display());

    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e);
        }
    };
    println!("   Config parsed and validated");

    let mut warnings = Vec::new();
    if config.providers.is_empty() {
        warnings.push("No AI providers configured".to_string());
    }
    for (name, provider) in &config.providers {
        if provider.api_key.is_none() {
            warnings.push(format!("Provider '{name}' has no API key"));
        }
    }
    for plugin in config.plugins.iter().filter(|p| !p.enabled) {
        warnings.push(format!("Plugin {} ({}) is disabled", plugin.id, plugin.name));
    }
    if config.engine.sweep_interval_secs == 0 {
        warnings.push("Queued-job sweep is disabled (engine.sweep_interval_secs = 0)".to_string());
    }

    for w in &warnings {
        println!("   warning: {w}");
    }

    println!();
    println!("   Storage:    {} ({})", config.storage.backend, config.storage.path);
    println!("   Queue:      {}", config.engine.queue_capacity);
    println!("   Providers:  {}", config.providers.len());
    println!("   Plugins:    {}", config.plugins.len());
    println!("   Tools:      {}", config.tools.len());
    Ok(())
}

pub async fn show(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(path)?;
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some("***".into());
        }
    }
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub async fn path(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", resolve(path).display());
    Ok(())
}

pub async fn init(path: Option<&Path>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let target = resolve(path);
    if target.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", target.display()).into());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, AppConfig::default_toml())?;
    println!("Wrote {}", target.display());
    Ok(())
}
