use ratatui::style::Color;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const APP_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub paywall: PaywallConfig,
    #[serde(default)]
    pub theme: ThemeConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_reveal_step_ms")]
    pub reveal_step_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_page_size() -> u32 {
    5
}

fn default_reveal_step_ms() -> u64 {
    20
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            page_size: default_page_size(),
            reveal_step_ms: default_reveal_step_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl GeneralConfig {
    pub fn page_size(&self) -> u32 {
        self.page_size.max(1)
    }

    pub fn reveal_step(&self) -> Duration {
        Duration::from_millis(self.reveal_step_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PaywallConfig {
    pub monthly_label: String,
    pub monthly_url: String,
    pub yearly_label: String,
    pub yearly_url: String,
}

impl Default for PaywallConfig {
    fn default() -> Self {
        Self {
            monthly_label: "Monthly Plan - $4.99/month".to_string(),
            monthly_url: "https://square.link/u/2kE5a3yh".to_string(),
            yearly_label: "Yearly Plan - $49.99/year".to_string(),
            yearly_url: "https://square.link/u/jcn1HdcF".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ThemeConfig {
    pub background: Color,
    pub foreground: Color,
    pub border_active: Color,
    pub border_inactive: Color,
    pub selection_bg: Color,
    pub selection_fg: Color,
    pub logo: Color,
    pub header: Color,
    pub timestamp: Color,
    pub feedback: Color,
    pub typing_cursor: Color,
    pub error: Color,
    pub notice: Color,
    pub premium: Color,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            background: Color::Reset,
            foreground: Color::Rgb(248, 248, 242),
            border_active: Color::Rgb(255, 121, 198),
            border_inactive: Color::Rgb(98, 114, 164),
            selection_bg: Color::Rgb(68, 71, 90),
            selection_fg: Color::Rgb(255, 121, 198),
            logo: Color::Rgb(189, 147, 249),
            header: Color::Rgb(255, 121, 198),
            timestamp: Color::Rgb(98, 114, 164),
            feedback: Color::Rgb(139, 233, 253),
            typing_cursor: Color::Rgb(80, 250, 123),
            error: Color::Rgb(255, 85, 85),
            notice: Color::Rgb(80, 250, 123),
            premium: Color::Magenta,
        }
    }
}

pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NIGHTINGALE_HOME") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nightingale")
}

/// Env var wins over the config file, which wins over the built-in default.
pub fn get_api_base_url(config: &AppConfig) -> String {
    let url = std::env::var("NIGHTINGALE_API_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| config.general.api_base_url.clone())
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    url.trim().trim_end_matches('/').to_string()
}

pub fn load_config() -> AppConfig {
    load_config_from(&get_config_dir())
}

pub fn load_config_from(dir: &Path) -> AppConfig {
    fs::create_dir_all(dir).ok();
    let path = dir.join("config.toml");

    if !path.exists() {
        let default_config = AppConfig::default();
        if let Ok(toml_str) = toml::to_string_pretty(&default_config) {
            if let Err(e) = write_private(&path, toml_str.as_bytes()) {
                tracing::warn!("Failed to write default config: {}", e);
            }
        }
        return default_config;
    }

    match fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to parse config.toml: {}", e);
                let backup_path = path.with_extension("toml.bak");
                if let Err(backup_err) = fs::rename(&path, &backup_path) {
                    tracing::warn!("Failed to backup corrupted config: {}", backup_err);
                } else {
                    tracing::warn!("Corrupted config backed up to {:?}", backup_path);
                }
                AppConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read config file: {}. Using default.", e);
            AppConfig::default()
        }
    }
}

/// Writes a file readable only by the current user.
pub fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    Ok(())
}
