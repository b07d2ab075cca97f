//! Configuration for the dealdesk engine.
//!
//! Settings load from `dealdesk.toml`, layered file → environment
//! (`DEALDESK_*`) → CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 3325
//! db_path = ".dealdesk/engine.db"
//! dev_mode = false
//!
//! [engine]
//! kyc_pass_threshold = 70
//! handoff_completion_delay_secs = 3
//! access_code_ttl_minutes = 30
//! analyzer_url = "http://localhost:9101"
//!
//! [poller]
//! critical_interval_secs = 3
//! secondary_interval_secs = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::engine::poller::PollerConfig;
use crate::engine::server::ServerConfig;

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite database location
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Bind on all interfaces and allow permissive CORS
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    3325
}

fn default_db_path() -> String {
    ".dealdesk/engine.db".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Lifecycle engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Minimum biometric score counted as a pass
    #[serde(default = "default_kyc_pass_threshold")]
    pub kyc_pass_threshold: i64,
    /// Seconds between package transmission and developer acceptance
    #[serde(default = "default_handoff_completion_delay_secs")]
    pub handoff_completion_delay_secs: u64,
    /// Minutes an invite code stays valid
    #[serde(default = "default_access_code_ttl_minutes")]
    pub access_code_ttl_minutes: u64,
    /// Identity analysis service; unset means a fixed stand-in score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer_url: Option<String>,
}

fn default_kyc_pass_threshold() -> i64 {
    70
}

fn default_handoff_completion_delay_secs() -> u64 {
    3
}

fn default_access_code_ttl_minutes() -> u64 {
    30
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            kyc_pass_threshold: default_kyc_pass_threshold(),
            handoff_completion_delay_secs: default_handoff_completion_delay_secs(),
            access_code_ttl_minutes: default_access_code_ttl_minutes(),
            analyzer_url: None,
        }
    }
}

impl EngineSection {
    /// Convert to EngineConfig for use with the engine.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            kyc_pass_threshold: self.kyc_pass_threshold,
            handoff_completion_delay: Duration::from_secs(self.handoff_completion_delay_secs),
            access_code_ttl: Duration::from_secs(self.access_code_ttl_minutes * 60),
        }
    }
}

/// Sync poller cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSection {
    /// Seconds between progress polls
    #[serde(default = "default_critical_interval_secs")]
    pub critical_interval_secs: u64,
    /// Seconds between full snapshot polls
    #[serde(default = "default_secondary_interval_secs")]
    pub secondary_interval_secs: u64,
}

fn default_critical_interval_secs() -> u64 {
    3
}

fn default_secondary_interval_secs() -> u64 {
    5
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            critical_interval_secs: default_critical_interval_secs(),
            secondary_interval_secs: default_secondary_interval_secs(),
        }
    }
}

impl PollerSection {
    /// Convert to PollerConfig for use with the sync poller.
    pub fn to_poller_config(&self) -> PollerConfig {
        PollerConfig {
            critical_interval: Duration::from_secs(self.critical_interval_secs),
            secondary_interval: Duration::from_secs(self.secondary_interval_secs),
        }
    }
}

/// The complete dealdesk.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DealdeskConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerSection,
    /// Lifecycle engine settings
    #[serde(default)]
    pub engine: EngineSection,
    /// Sync poller cadences
    #[serde(default)]
    pub poller: PollerSection,
}

impl DealdeskConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse dealdesk.toml")
    }

    /// Load configuration from the given path, or defaults if the file does
    /// not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize dealdesk.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Get the port (env DEALDESK_PORT overrides the file).
    pub fn port(&self) -> u16 {
        if let Ok(value) = std::env::var("DEALDESK_PORT")
            && let Ok(port) = value.parse()
        {
            return port;
        }
        self.server.port
    }

    /// Get the database path (env DEALDESK_DB_PATH overrides the file).
    pub fn db_path(&self) -> PathBuf {
        if let Ok(value) = std::env::var("DEALDESK_DB_PATH")
            && !value.is_empty()
        {
            return PathBuf::from(value);
        }
        PathBuf::from(&self.server.db_path)
    }

    /// Get the analyzer URL (env DEALDESK_ANALYZER_URL overrides the file).
    pub fn analyzer_url(&self) -> Option<String> {
        if let Ok(value) = std::env::var("DEALDESK_ANALYZER_URL")
            && !value.is_empty()
        {
            return Some(value);
        }
        self.engine.analyzer_url.clone()
    }

    /// Assemble the server configuration, applying environment overrides.
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port(),
            db_path: self.db_path(),
            analyzer_url: self.analyzer_url(),
            dev_mode: self.server.dev_mode,
            engine: self.engine.to_engine_config(),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !(0..=100).contains(&self.engine.kyc_pass_threshold) {
            warnings.push(format!(
                "kyc_pass_threshold {} is outside 0-100; every analysis will land on one side",
                self.engine.kyc_pass_threshold
            ));
        }
        if self.engine.access_code_ttl_minutes == 0 {
            warnings.push("access_code_ttl_minutes is 0: invite codes expire immediately".into());
        }
        if self.poller.critical_interval_secs == 0 || self.poller.secondary_interval_secs == 0 {
            warnings.push("poller intervals must be at least 1 second".into());
        }
        if self.poller.critical_interval_secs > self.poller.secondary_interval_secs {
            warnings.push(format!(
                "critical interval ({}s) is slower than the secondary interval ({}s)",
                self.poller.critical_interval_secs, self.poller.secondary_interval_secs
            ));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_parse_empty() {
        let config = DealdeskConfig::parse("").unwrap();
        assert_eq!(config.server.port, 3325);
        assert_eq!(config.server.db_path, ".dealdesk/engine.db");
        assert!(!config.server.dev_mode);
        assert_eq!(config.engine.kyc_pass_threshold, 70);
        assert_eq!(config.engine.handoff_completion_delay_secs, 3);
        assert_eq!(config.engine.access_code_ttl_minutes, 30);
        assert!(config.engine.analyzer_url.is_none());
        assert_eq!(config.poller.critical_interval_secs, 3);
        assert_eq!(config.poller.secondary_interval_secs, 5);
    }

    #[test]
    fn test_parse_full() {
        let content = r#"
[server]
port = 8080
db_path = "/var/lib/dealdesk/engine.db"
dev_mode = true

[engine]
kyc_pass_threshold = 85
handoff_completion_delay_secs = 10
access_code_ttl_minutes = 5
analyzer_url = "http://analyzer:9101"

[poller]
critical_interval_secs = 1
secondary_interval_secs = 2
"#;
        let config = DealdeskConfig::parse(content).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.db_path, "/var/lib/dealdesk/engine.db");
        assert!(config.server.dev_mode);
        assert_eq!(config.engine.kyc_pass_threshold, 85);
        assert_eq!(config.engine.analyzer_url.as_deref(), Some("http://analyzer:9101"));
        assert_eq!(config.poller.critical_interval_secs, 1);
    }

    #[test]
    fn test_parse_partial_section() {
        let content = r#"
[engine]
kyc_pass_threshold = 90
"#;
        let config = DealdeskConfig::parse(content).unwrap();
        assert_eq!(config.engine.kyc_pass_threshold, 90);
        // Other fields keep their defaults
        assert_eq!(config.engine.handoff_completion_delay_secs, 3);
        assert_eq!(config.server.port, 3325);
    }

    #[test]
    fn test_to_engine_config_durations() {
        let content = r#"
[engine]
handoff_completion_delay_secs = 7
access_code_ttl_minutes = 2
"#;
        let config = DealdeskConfig::parse(content).unwrap();
        let engine = config.engine.to_engine_config();
        assert_eq!(engine.handoff_completion_delay, Duration::from_secs(7));
        assert_eq!(engine.access_code_ttl, Duration::from_secs(120));
        assert_eq!(engine.kyc_pass_threshold, 70);
    }

    #[test]
    fn test_to_poller_config() {
        let poller = PollerSection::default().to_poller_config();
        assert_eq!(poller.critical_interval, Duration::from_secs(3));
        assert_eq!(poller.secondary_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_to_server_config() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("DEALDESK_PORT").ok();
        unsafe { std::env::remove_var("DEALDESK_PORT") };

        let content = r#"
[server]
port = 9000

[engine]
analyzer_url = "http://analyzer:9101"
"#;
        let config = DealdeskConfig::parse(content).unwrap();
        let server = config.to_server_config();
        assert_eq!(server.port, 9000);
        assert_eq!(server.analyzer_url.as_deref(), Some("http://analyzer:9101"));
        assert!(!server.dev_mode);

        if let Some(val) = saved {
            unsafe { std::env::set_var("DEALDESK_PORT", val) };
        }
    }

    #[test]
    fn test_env_overrides_port() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("DEALDESK_PORT").ok();

        unsafe { std::env::set_var("DEALDESK_PORT", "4444") };
        let config = DealdeskConfig::default();
        assert_eq!(config.port(), 4444);

        unsafe { std::env::remove_var("DEALDESK_PORT") };
        assert_eq!(config.port(), 3325);

        if let Some(val) = saved {
            unsafe { std::env::set_var("DEALDESK_PORT", val) };
        }
    }

    #[test]
    fn test_validate_valid() {
        assert!(DealdeskConfig::default().validate().is_empty());
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let content = r#"
[engine]
kyc_pass_threshold = 150
access_code_ttl_minutes = 0

[poller]
critical_interval_secs = 10
secondary_interval_secs = 5
"#;
        let config = DealdeskConfig::parse(content).unwrap();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("kyc_pass_threshold"));
        assert!(warnings[1].contains("access_code_ttl_minutes"));
        assert!(warnings[2].contains("secondary interval"));
    }

    #[test]
    fn test_load_and_save() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dealdesk.toml");

        let mut config = DealdeskConfig::default();
        config.server.port = 9999;
        config.engine.kyc_pass_threshold = 80;

        config.save(&path).unwrap();

        let loaded = DealdeskConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9999);
        assert_eq!(loaded.engine.kyc_pass_threshold, 80);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = DealdeskConfig::load_or_default(&dir.path().join("dealdesk.toml")).unwrap();
        assert_eq!(config.server.port, 3325);
    }
}
