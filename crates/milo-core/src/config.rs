//! Milo configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MiloError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MiloConfig {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl MiloConfig {
    /// Load config from `MILO_CONFIG` or the default path (~/.milo/config.toml).
    pub fn load() -> Result<Self> {
        let path = std::env::var("MILO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            let mut config = Self::default();
            config.apply_env();
            Ok(config)
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MiloError::Config(format!("Failed to read config: {e}")))?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| MiloError::Config(format!("Failed to parse config: {e}")))?;
        config.apply_env();
        Ok(config)
    }

    /// Save config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| MiloError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Secrets from the environment win over the file.
    fn apply_env(&mut self) {
        if let Ok(password) = std::env::var("MILO_SMTP_PASSWORD")
            && !password.is_empty()
        {
            self.smtp.password = password;
        }
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Milo home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".milo")
    }
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain connect, then upgrade with STARTTLS (port 587).
    #[default]
    Starttls,
    /// Implicit TLS from the first byte (port 465).
    Tls,
    /// No encryption. Local relays and tests only.
    None,
}

/// Outbound SMTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub security: SmtpSecurity,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_hello_name")]
    pub hello_name: String,
    /// Upper bound for each connect, authenticate, and send call.
    #[serde(default = "default_op_timeout")]
    pub timeout_secs: u64,
}

fn default_smtp_host() -> String { "smtp.gmail.com".into() }
fn default_smtp_port() -> u16 { 587 }
fn default_from_email() -> String { "noreply@milo.local".into() }
fn default_from_name() -> String { "Milo Reports".into() }
fn default_hello_name() -> String { "milo.local".into() }
fn default_op_timeout() -> u64 { 30 }

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            security: SmtpSecurity::default(),
            username: String::new(),
            password: String::new(),
            from_email: default_from_email(),
            from_name: default_from_name(),
            hello_name: default_hello_name(),
            timeout_secs: default_op_timeout(),
        }
    }
}

impl SmtpConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

/// Background scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Short poll interval while waiting for a window.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// How long after the target time a tick still counts as "in the window".
    #[serde(default = "default_window")]
    pub window_secs: u64,
    /// Back-off after a tick-level error.
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    /// Offset from UTC that schedule times are written in (e.g. 120 for SAST).
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn bool_true() -> bool { true }
fn default_poll_interval() -> u64 { 60 }
fn default_window() -> u64 { 60 }
fn default_error_backoff() -> u64 { 300 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval(),
            window_secs: default_window(),
            error_backoff_secs: default_error_backoff(),
            utc_offset_minutes: 0,
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Public dashboard link included in report emails.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            public_url: None,
        }
    }
}

/// SQLite storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.milo/milo.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}
