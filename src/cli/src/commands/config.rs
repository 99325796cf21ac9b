//! CLI settings kept in `~/.unojobs/config.toml`.
//!
//! Flags and environment variables win over the file: `--api-url` and
//! `UNO_JOBS_API_URL` override `api-url`.

use anyhow::{bail, Context, Result};
use clap::{Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Store a setting
    Set { key: ConfigKey, value: String },

    /// Print one setting
    Get { key: ConfigKey },

    /// Print every stored setting
    Show,

    /// Print the settings file location
    Path,

    /// Delete the settings file
    Reset {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfigKey {
    /// Base URL of the engine, e.g. http://localhost:8080
    ApiUrl,
    /// HTTP request timeout in seconds
    Timeout,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Settings {
    fn get(&self, key: ConfigKey) -> Option<String> {
        match key {
            ConfigKey::ApiUrl => self.api_url.clone(),
            ConfigKey::Timeout => self.timeout.map(|t| t.to_string()),
        }
    }

    fn set(&mut self, key: ConfigKey, value: &str) -> Result<()> {
        match key {
            ConfigKey::ApiUrl => {
                if !value.starts_with("http://") && !value.starts_with("https://") {
                    bail!("api-url must start with http:// or https://");
                }
                self.api_url = Some(value.trim_end_matches('/').to_string());
            }
            ConfigKey::Timeout => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("timeout must be whole seconds, got '{}'", value))?;
                if secs == 0 {
                    bail!("timeout must be at least 1 second");
                }
                self.timeout = Some(secs);
            }
        }
        Ok(())
    }

    /// Read the settings file. A missing file yields empty settings.
    pub fn load() -> Result<Self> {
        let path = settings_path()?;
        match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw).with_context(|| format!("Invalid settings in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn save(&self) -> Result<()> {
        let path = settings_path()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("Failed to encode settings")?;
        std::fs::write(&path, raw).with_context(|| format!("Failed to write {}", path.display()))
    }
}

fn settings_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".unojobs").join("config.toml"))
}

fn key_name(key: ConfigKey) -> String {
    key.to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default()
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Set { key, value } => {
            let mut settings = Settings::load()?;
            settings.set(key, &value)?;
            settings.save()?;
            output::print_success(&format!("{} = {}", key_name(key), value));
        }

        ConfigCommands::Get { key } => match Settings::load()?.get(key) {
            Some(value) => println!("{}", value),
            None => bail!("{} is not set", key_name(key)),
        },

        ConfigCommands::Show => {
            let settings = Settings::load()?;
            match format {
                OutputFormat::Table => {
                    output::print_header("Settings");
                    for key in ConfigKey::value_variants() {
                        let value = settings.get(*key).unwrap_or_else(|| "-".to_string());
                        output::print_detail(&key_name(*key), &value);
                    }
                }
                _ => output::print_item(&settings, format)?,
            }
        }

        ConfigCommands::Path => println!("{}", settings_path()?.display()),

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This deletes every stored setting. Use --force to confirm.");
                return Ok(());
            }
            let path = settings_path()?;
            match std::fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
                }
                _ => output::print_success("Settings cleared"),
            }
        }
    }

    Ok(())
}
