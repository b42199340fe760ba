use crate::{DmsError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for the DMS control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application-specific settings
    pub application: ApplicationConfig,

    /// Part 11 compliance settings
    pub compliance: ComplianceConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Security and session configuration
    pub security: SecurityConfig,

    /// Draft editing configuration (locks, autosave)
    pub editing: EditingConfig,

    /// Blob storage configuration
    pub storage: StorageConfig,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Organization name stamped on exports
    pub organization_name: String,

    /// Listen address for the HTTP surface
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Part 11 compliance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Audit retention period in days (minimum 7 years)
    #[serde(default = "default_audit_retention")]
    pub audit_retention_days: u32,

    /// Require electronic signatures on lifecycle transitions
    #[serde(default = "default_true")]
    pub require_electronic_signatures: bool,
}

/// Logging configuration for the trace log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path
    #[serde(default = "default_log_file")]
    pub file: String,

    /// Use JSON format for structured logging
    #[serde(default = "default_true")]
    pub json_format: bool,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (file path or :memory:)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Enable WAL mode for better concurrency
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

/// Security and session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Bearer session lifetime in minutes of wall clock
    #[serde(default = "default_session_timeout")]
    pub session_timeout_minutes: i64,

    /// PBKDF2 iteration count for credential hashing
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,

    /// Minimum credential length accepted at principal creation
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
}

/// Draft editing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditingConfig {
    /// Default edit-lock lease in minutes
    #[serde(default = "default_lock_minutes")]
    pub default_lock_minutes: i64,

    /// Maximum edit-lock lease a client may request, in minutes
    #[serde(default = "default_max_lock_minutes")]
    pub max_lock_minutes: i64,

    /// Expected client heartbeat cadence in seconds
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u32,

    /// Expected client autosave cadence in seconds
    #[serde(default = "default_autosave_seconds")]
    pub autosave_seconds: u32,

    /// Record every Nth autosave in the audit trail (plus the first)
    #[serde(default = "default_autosave_audit_interval")]
    pub autosave_audit_interval: u32,
}

/// Blob storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding attachment blobs keyed by content hash
    #[serde(default = "default_attachment_dir")]
    pub attachment_directory: String,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DmsError::Config {
            message: format!("Failed to read config file: {}", e),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| DmsError::Config {
            message: format!("Failed to parse config file: {}", e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for Part 11 compliance
    pub fn validate(&self) -> Result<()> {
        if self.compliance.audit_retention_days < 2555 {
            return Err(DmsError::validation(
                "audit_retention_days",
                "audit retention must cover at least 7 years (2555 days)",
            ));
        }

        if self.application.organization_name.trim().is_empty() {
            return Err(DmsError::validation(
                "organization_name",
                "organization name is required",
            ));
        }

        if self.editing.default_lock_minutes < 1
            || self.editing.default_lock_minutes > self.editing.max_lock_minutes
        {
            return Err(DmsError::validation(
                "default_lock_minutes",
                "default lock lease must be between 1 minute and the configured maximum",
            ));
        }

        if self.editing.autosave_audit_interval == 0 {
            return Err(DmsError::validation(
                "autosave_audit_interval",
                "autosave audit interval must be at least 1",
            ));
        }

        if self.security.session_timeout_minutes < 1 {
            return Err(DmsError::validation(
                "session_timeout_minutes",
                "session timeout must be at least 1 minute",
            ));
        }

        Ok(())
    }

    /// Generate sample configuration
    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_else(|_| String::new())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            compliance: ComplianceConfig::default(),
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            security: SecurityConfig::default(),
            editing: EditingConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            organization_name: "Pharma Operations".to_string(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            audit_retention_days: default_audit_retention(),
            require_electronic_signatures: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            json_format: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            wal_mode: true,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_timeout_minutes: default_session_timeout(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
            min_password_length: default_min_password_length(),
        }
    }
}

impl Default for EditingConfig {
    fn default() -> Self {
        Self {
            default_lock_minutes: default_lock_minutes(),
            max_lock_minutes: default_max_lock_minutes(),
            heartbeat_seconds: default_heartbeat_seconds(),
            autosave_seconds: default_autosave_seconds(),
            autosave_audit_interval: default_autosave_audit_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            attachment_directory: default_attachment_dir(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_audit_retention() -> u32 {
    2555 // 7 years
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_file() -> String {
    "./dms-data/dms.log".to_string()
}
fn default_database_url() -> String {
    "./dms-data/dms.db".to_string()
}
fn default_session_timeout() -> i64 {
    60
}
fn default_pbkdf2_iterations() -> u32 {
    100_000
}
fn default_min_password_length() -> usize {
    12
}
fn default_lock_minutes() -> i64 {
    30
}
fn default_max_lock_minutes() -> i64 {
    60
}
fn default_heartbeat_seconds() -> u32 {
    15
}
fn default_autosave_seconds() -> u32 {
    10
}
fn default_autosave_audit_interval() -> u32 {
    10
}
fn default_attachment_dir() -> String {
    "./dms-data/attachments".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation_success() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_audit_retention() {
        let mut config = Config::default();
        config.compliance.audit_retention_days = 365;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_organization_name() {
        let mut config = Config::default();
        config.application.organization_name = "".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_lock_lease_bounds() {
        let mut config = Config::default();
        config.editing.default_lock_minutes = 90; // above max
        assert!(config.validate().is_err());

        config.editing.default_lock_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_sample_generation() {
        let sample = Config::generate_sample();
        assert!(sample.contains("organization_name"));
        assert!(sample.contains("session_timeout_minutes"));
        assert!(sample.contains("default_lock_minutes"));
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.security.session_timeout_minutes, 60);
        assert_eq!(config.editing.default_lock_minutes, 30);
        assert_eq!(config.editing.max_lock_minutes, 60);
        assert_eq!(config.editing.heartbeat_seconds, 15);
        assert_eq!(config.editing.autosave_seconds, 10);
        assert_eq!(config.editing.autosave_audit_interval, 10);
        assert!(config.compliance.require_electronic_signatures);
    }

    #[test]
    fn test_config_roundtrip_through_toml() {
        let sample = Config::generate_sample();
        let parsed: Config = toml::from_str(&sample).unwrap();
        assert!(parsed.validate().is_ok());
    }
}
