use anyhow::Result;

use crate::cli::output::{OutputFormat, OutputOptions};
use crate::core::client::{ManagementApi, ManagementClient};
use crate::core::config::AppConfig;
use crate::core::points::{redact, REDACTED};

pub fn init(_opts: &OutputOptions) -> Result<()> {
    let path = AppConfig::config_path();
    if path.exists() {
        eprintln!("Config file already exists at {}", path.display());
        eprintln!("Remove it first if you want to regenerate.");
        return Ok(());
    }

    match AppConfig::default().save() {
        Ok(path) => {
            println!("Generated config at {}", path.display());
            println!(
                "  Set server.management_key (or export {}) before polling.",
                crate::core::config::MANAGEMENT_KEY_ENV
            );
        }
        Err(e) => {
            eprintln!("Failed to generate config: {}", e);
            std::process::exit(1);
        }
    }
    Ok(())
}

/// Validate the config file; with `probe`, also authenticate against the server.
pub async fn check(probe: bool, _opts: &OutputOptions) -> Result<()> {
    let path = AppConfig::config_path();
    if !path.exists() {
        println!("No config file found at {}", path.display());
        println!("Using defaults. Run `cpb config init` to create one.");
        return Ok(());
    }

    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {}", e);
            std::process::exit(1);
        }
    };

    let issues = config.validate();
    if !issues.is_empty() {
        eprintln!("Config issues found:");
        for issue in &issues {
            eprintln!("  - {}", issue);
        }
        std::process::exit(1);
    }
    println!("Config is valid ({})", path.display());

    if probe {
        let client = ManagementClient::new(&config.base_url()?, config.server.management_key.clone())?;
        match client.validate().await {
            Ok(()) => println!("Connected to {}", client.base_url()),
            Err(e) => {
                eprintln!("Cannot reach {}: {}", client.base_url(), e);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

/// Print the effective config with the management key hidden.
pub fn show(opts: &OutputOptions) -> Result<()> {
    let mut config = AppConfig::load()?;
    match opts.format {
        OutputFormat::Json => {
            let mut entry = config.to_entry();
            redact(&mut entry);
            println!("{}", opts.to_json(&entry)?);
        }
        OutputFormat::Text => {
            if !config.server.management_key.is_empty() {
                config.server.management_key = REDACTED.to_string();
            }
            println!("# {}", AppConfig::config_path().display());
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
