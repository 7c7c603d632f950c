//! Layered configuration: embedded defaults, optional file, then environment.

use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File, FileFormat};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::identity::Version;
use crate::protocol::PartialResultPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub max_request_size_kb: usize,
    /// Allowed CORS origins; `"*"` allows any.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            rate_limit_per_minute: 600,
            max_request_size_kb: 256,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            enable_target: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-request budget; 0 disables the timeout.
    pub request_timeout_ms: u64,
    pub partial_results: PartialResultPolicy,
    pub concurrent_support: bool,
    pub min_classifier_score: f64,
    /// Key under which supporting results are merged.
    pub supporting_key: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            partial_results: PartialResultPolicy::ReturnPartial,
            concurrent_support: false,
            min_classifier_score: 1.0,
            supporting_key: "supporting".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub max_query_bytes: usize,
    pub max_result_bytes: usize,
    /// Regular expressions; a match in a query or result fails the safety rule.
    pub disallowed_markers: Vec<String>,
    /// Domain → extra names it may be requested under.
    pub domain_aliases: BTreeMap<String, Vec<String>>,
    pub require_knowledge_contract: bool,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            max_query_bytes: 8 * 1024,
            max_result_bytes: 256 * 1024,
            disallowed_markers: Vec::new(),
            domain_aliases: BTreeMap::new(),
            require_knowledge_contract: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// 0 keeps every record.
    pub max_records: usize,
    /// 0 aggregates over all records.
    pub default_window_secs: u64,
    /// Accuracy scores kept per agent; 0 keeps every score.
    pub max_feedback_per_agent: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_records: 100_000,
            default_window_secs: 0,
            max_feedback_per_agent: 1_000,
        }
    }
}

/// A knowledge-backed agent registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub namespace: String,
    pub domain: String,
    pub version: Version,
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Knowledge document (JSON); relative paths resolve against the working directory.
    pub knowledge: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub orchestrator: OrchestratorConfig,
    pub governance: GovernanceConfig,
    pub monitoring: MonitoringConfig,
    pub agents: Vec<AgentSpec>,
    pub otlp_endpoint: Option<String>,
}

impl Settings {
    /// Load settings, layering an explicit file (or `./dsa.toml` when present)
    /// and `DSA__SECTION__KEY` environment variables over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from_str(include_str!("../config.toml"), FileFormat::Toml));

        builder = match path {
            Some(path) => builder.add_source(File::from(path.to_path_buf()).required(true)),
            None => builder.add_source(File::with_name("dsa").required(false)),
        };

        let config = builder
            .add_source(
                Environment::with_prefix("DSA")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("governance.disallowed_markers")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        let settings: Settings = config
            .try_deserialize()
            .context("invalid configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.server.rate_limit_per_minute == 0 {
            return Err(anyhow!("Rate limit must allow at least one request per minute"));
        }
        if self.governance.max_query_bytes == 0 || self.governance.max_result_bytes == 0 {
            return Err(anyhow!("Governance size limits must be positive"));
        }
        RegexSet::new(&self.governance.disallowed_markers)
            .context("invalid governance.disallowed_markers pattern")?;
        if !self.orchestrator.min_classifier_score.is_finite()
            || self.orchestrator.min_classifier_score < 0.0
        {
            return Err(anyhow!("min_classifier_score must be a non-negative number"));
        }
        if self.orchestrator.supporting_key.trim().is_empty() {
            return Err(anyhow!("supporting_key cannot be empty"));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(anyhow!(
                "Unknown log format '{}', expected 'text' or 'json'",
                self.logging.format
            ));
        }
        for spec in &self.agents {
            if spec.capabilities.is_empty() {
                return Err(anyhow!("Agent '{}' declares no capabilities", spec.domain));
            }
            if !spec.knowledge.exists() {
                warn!("Knowledge file does not exist: {:?}", spec.knowledge);
            }
        }
        if self.orchestrator.request_timeout_ms == 0 {
            warn!("Request timeout disabled; slow agents can stall requests indefinitely");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.orchestrator.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn default_window(&self) -> Option<Duration> {
        match self.monitoring.default_window_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_embedded_defaults_are_valid() {
        let settings = Settings::load(Some(Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/config.toml"
        ))))
        .unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.logging.format, "text");
        assert_eq!(settings.orchestrator.partial_results, PartialResultPolicy::ReturnPartial);
        assert_eq!(settings.request_timeout(), Some(Duration::from_secs(30)));
        assert!(settings.agents.is_empty());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[orchestrator]
request_timeout_ms = 0
partial_results = "abort"

[governance]
disallowed_markers = ["(?i)password"]

[governance.domain_aliases]
finance = ["money"]
"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.request_timeout(), None);
        assert_eq!(settings.orchestrator.partial_results, PartialResultPolicy::Abort);
        assert_eq!(settings.governance.disallowed_markers, vec!["(?i)password"]);
        assert_eq!(settings.governance.domain_aliases["finance"], vec!["money"]);
        // Untouched sections keep their defaults.
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.governance.disallowed_markers = vec!["(unclosed".to_string()];
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.format = "yaml".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.server.port = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/dsa.toml"))).is_err());
    }
}
