//! `agentrelay config`: Configuration management commands.

use agentrelay_config::AppConfig;

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   ok  Config parsed successfully");

            let warnings = soft_warnings(&config);
            if warnings.is_empty() {
                println!("   ok  All checks passed");
            } else {
                println!();
                for w in &warnings {
                    println!("   !!  {w}");
                }
            }

            println!();
            println!("   Provider:   {}", config.default_provider);
            println!("   Model:      {}", config.default_model);
            println!("   Gateway:    {}:{}", config.gateway.host, config.gateway.port);
            println!("   Memory:     {}", config.memory.backend);
            println!("   Iterations: {}", config.orchestrator.max_iterations);
            println!("   Agents:     {}", config.agents.len());
        }
        Err(e) => {
            println!("   xx  Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Problems that do not stop startup but usually mean a misconfiguration.
fn soft_warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    let provider_key = config
        .providers
        .get(&config.default_provider)
        .and_then(|p| p.api_key.as_ref());
    if !config.has_api_key() && provider_key.is_none() {
        warnings.push("No API key set (set AGENTRELAY_API_KEY or OPENAI_API_KEY)".to_string());
    }

    if config.agents.is_empty() {
        warnings.push("No [[agents]] configured; only plain chat is available".to_string());
    }

    if config.orchestrator.tool_timeout().is_none() {
        warnings.push("orchestrator.tool_timeout_secs = 0 disables the tool timeout".to_string());
    }

    warnings
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}

pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let dir = AppConfig::config_dir();
    let config_path = dir.join("config.toml");

    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        return Ok(());
    }

    std::fs::create_dir_all(&dir)?;
    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("Wrote default config to {}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_is_valid() {
        let path = AppConfig::config_dir().join("config.toml");
        assert!(path.to_str().unwrap().contains("config.toml"));
    }

    #[test]
    fn default_config_warns_about_key_and_agents() {
        let mut config = AppConfig::default();
        config.api_key = None;
        config.providers.clear();
        let warnings = soft_warnings(&config);
        assert!(warnings.iter().any(|w| w.contains("API key")));
        assert!(warnings.iter().any(|w| w.contains("[[agents]]")));
    }

    #[test]
    fn default_toml_round_trips_through_validation() {
        let config: AppConfig = toml::from_str(&AppConfig::default_toml()).unwrap();
        assert!(config.validate().is_ok());
    }
}
