use clap::Parser;
use std::path::PathBuf;

/// FDA 21 CFR Part 11 Compliant Document Management System for controlled SOPs
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "dmsrs")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dms-config.toml")]
    pub config_path: PathBuf,

    /// Database URL override
    #[arg(short, long)]
    pub database_url: Option<String>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Listen address override for the HTTP surface
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Initialize database schema and exit
    #[arg(long)]
    pub init_db: bool,

    /// Generate sample configuration file and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Bootstrap an admin principal (username); prompts nothing, reads the
    /// credential from DMS_BOOTSTRAP_CREDENTIAL
    #[arg(long)]
    pub bootstrap_admin: Option<String>,

    /// Delete expired edit-lock rows and exit
    #[arg(long)]
    pub sweep_locks: bool,
}

impl Cli {
    /// Validate CLI arguments before startup
    pub fn validate(&self) -> crate::Result<()> {
        if !self.generate_config && !self.config_path.exists() {
            return Err(crate::DmsError::Config {
                message: format!("Configuration file not found: {}", self.config_path.display()),
            });
        }
        Ok(())
    }

    /// Get effective log level
    pub fn effective_log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_values() {
        let cli = Cli::parse_from(["dmsrs"]);
        assert_eq!(cli.config_path, PathBuf::from("dms-config.toml"));
        assert_eq!(cli.database_url, None);
        assert_eq!(cli.log_level, None);
        assert!(!cli.init_db);
        assert!(!cli.generate_config);
        assert!(cli.bootstrap_admin.is_none());
        assert!(!cli.sweep_locks);
    }

    #[test]
    fn test_cli_parsing_with_args() {
        let cli = Cli::parse_from([
            "dmsrs",
            "--config-path",
            "/tmp/test.toml",
            "--database-url",
            "/tmp/test.db",
            "--log-level",
            "debug",
            "--listen-addr",
            "0.0.0.0:9000",
            "--bootstrap-admin",
            "root",
        ]);

        assert_eq!(cli.config_path, PathBuf::from("/tmp/test.toml"));
        assert_eq!(cli.database_url, Some("/tmp/test.db".to_string()));
        assert_eq!(cli.log_level, Some("debug".to_string()));
        assert_eq!(cli.listen_addr, Some("0.0.0.0:9000".to_string()));
        assert_eq!(cli.bootstrap_admin, Some("root".to_string()));
    }

    #[test]
    fn test_validation_requires_config_file() {
        let cli = Cli::parse_from(["dmsrs", "--config-path", "/nonexistent/dms.toml"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from([
            "dmsrs",
            "--config-path",
            "/nonexistent/dms.toml",
            "--generate-config",
        ]);
        assert!(cli.validate().is_ok());
    }
}
