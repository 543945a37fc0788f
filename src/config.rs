use anyhow::Result;
use chrono::NaiveDate;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the proposal workflow engine
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Unit code of the central science office
    pub central_office_unit: String,
    /// Replay and in-flight deduplication
    pub idempotency: IdempotencyConfig,
    /// Transaction retry policy
    pub transactions: TransactionConfig,
    /// Default review window
    pub sla: SlaConfig,
    /// Working-day calendar
    pub calendar: CalendarConfig,
    /// Background audit delivery
    pub audit: AuditConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub response_ttl_seconds: u64,
    pub max_cached_responses: u64,
    /// How long completed transitions are replayed; 0 disables retention
    pub completed_retention_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SlaConfig {
    pub business_days: u32,
    pub cutoff_hour: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub utc_offset_hours: i32,
    pub holidays: Vec<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    /// How long shutdown waits for queued audit records
    pub drain_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            response_ttl_seconds: 300,
            max_cached_responses: 10_000,
            completed_retention_seconds: 300,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
        }
    }
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self {
            business_days: 3,
            cutoff_hour: 17,
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: 7,
            holidays: Vec::new(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 100,
            drain_timeout_seconds: 5,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://proposal-flow.db".to_string(),
            max_connections: 5,
            auto_migrate: true,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            central_office_unit: "PHONG_KHCN".to_string(),
            idempotency: IdempotencyConfig::default(),
            transactions: TransactionConfig::default(),
            sla: SlaConfig::default(),
            calendar: CalendarConfig::default(),
            audit: AuditConfig::default(),
            observability: ObservabilityConfig::default(),
            database: None,
        }
    }
}

impl IdempotencyConfig {
    pub fn response_ttl(&self) -> Duration {
        Duration::from_secs(self.response_ttl_seconds)
    }

    pub fn completed_retention(&self) -> Option<Duration> {
        (self.completed_retention_seconds > 0)
            .then(|| Duration::from_secs(self.completed_retention_seconds))
    }
}

impl TransactionConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }
}

impl AuditConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }
}

impl WorkflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (proposal-flow.toml, .proposal-flow-rc)
    /// 3. Environment variables (prefixed with PROPOSAL_FLOW__)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`load`](Self::load) with config files looked up in `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        // Missing keys fall back to the serde defaults
        let mut builder = Config::builder();

        let toml_path = dir.join("proposal-flow.toml");
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path));
        }

        let rc_path = dir.join(".proposal-flow-rc");
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(config::FileFormat::Toml));
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("PROPOSAL_FLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let workflow_config: WorkflowConfig = config.try_deserialize()?;
        workflow_config.validate()?;
        Ok(workflow_config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transactions.max_attempts == 0 {
            anyhow::bail!("transactions.max_attempts must be at least 1");
        }
        if self.sla.cutoff_hour > 23 {
            anyhow::bail!("sla.cutoff_hour must be between 0 and 23");
        }
        if !(-23..=23).contains(&self.calendar.utc_offset_hours) {
            anyhow::bail!("calendar.utc_offset_hours must be between -23 and 23");
        }
        if self.central_office_unit.trim().is_empty() {
            anyhow::bail!("central_office_unit must not be empty");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<WorkflowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = WorkflowConfig::load_env_file();
        WorkflowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static WorkflowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = WorkflowConfig::default();
        assert_eq!(config.idempotency.response_ttl_seconds, 300);
        assert_eq!(config.idempotency.max_cached_responses, 10_000);
        assert_eq!(config.transactions.max_attempts, 3);
        assert_eq!(config.sla.business_days, 3);
        assert_eq!(config.sla.cutoff_hour, 17);
        assert_eq!(config.calendar.utc_offset_hours, 7);
        assert_eq!(config.central_office_unit, "PHONG_KHCN");
        assert!(config.database.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("proposal-flow.toml"),
            "central_office_unit = \"RESEARCH_OFFICE\"\n\n[sla]\nbusiness_days = 5\n",
        )
        .unwrap();

        let config = WorkflowConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.central_office_unit, "RESEARCH_OFFICE");
        assert_eq!(config.sla.business_days, 5);
        assert_eq!(config.sla.cutoff_hour, 17);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = TempDir::new().unwrap();
        let mut config = WorkflowConfig::default();
        config.audit.max_retries = 7;
        config.database = Some(DatabaseConfig::default());
        config.save_to_file(dir.path().join("proposal-flow.toml")).unwrap();

        let loaded = WorkflowConfig::load_from(dir.path()).unwrap();
        assert_eq!(loaded.audit.max_retries, 7);
        assert_eq!(loaded.database, Some(DatabaseConfig::default()));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = WorkflowConfig::default();
        config.transactions.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retention_disables_replay_window() {
        let mut config = WorkflowConfig::default();
        config.idempotency.completed_retention_seconds = 0;
        assert_eq!(config.idempotency.completed_retention(), None);
    }
}
