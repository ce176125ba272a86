// ABOUTME: loads the agent's toml configuration and substitutes ${VAR} placeholders from the environment.
// ABOUTME: resolves relative file paths against the config file's directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("environment variable not set for {field} = {placeholder}")]
    MissingSecret { field: &'static str, placeholder: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    pub monitoring: MonitoringConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    #[serde(default = "default_deny_list_file")]
    pub deny_list_file: PathBuf,
    #[serde(default = "default_auto_keywords_file")]
    pub auto_keywords_file: PathBuf,
    #[serde(default = "default_prompt_file")]
    pub prompt_file: PathBuf,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl SecurityConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            deny_list_file: default_deny_list_file(),
            auto_keywords_file: default_auto_keywords_file(),
            prompt_file: default_prompt_file(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Journal,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    pub source: SourceKind,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_error_levels")]
    pub error_levels: Vec<String>,
    #[serde(default = "default_error_keywords")]
    pub error_keywords: Vec<String>,
    /// Log events handled at the same time. Further events wait in the queue.
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default = "default_slack_username")]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Also write logs here, rotated by `rotation`.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub rotation: LogRotation,
    /// Rotated files kept next to the active one.
    #[serde(default = "default_log_max_files")]
    pub max_files: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
            rotation: LogRotation::default(),
            max_files: default_log_max_files(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/tmp/sre-agentd.sock")
}
fn default_deny_list_file() -> PathBuf {
    PathBuf::from("deny_list.txt")
}
fn default_auto_keywords_file() -> PathBuf {
    PathBuf::from("auto_keywords.txt")
}
fn default_prompt_file() -> PathBuf {
    PathBuf::from("prompt.txt")
}
fn default_command_timeout_secs() -> u64 {
    15
}
fn default_error_levels() -> Vec<String> {
    ["err", "crit", "alert", "emerg"].map(String::from).to_vec()
}
fn default_error_keywords() -> Vec<String> {
    ["ERROR", "CRITICAL", "FATAL"].map(String::from).to_vec()
}
fn default_max_concurrent_events() -> usize {
    1
}
fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_llm_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_slack_username() -> String {
    "sre-agent".to_string()
}
fn default_ledger_path() -> PathBuf {
    PathBuf::from("data/incidents.jsonl")
}
fn default_audit_path() -> PathBuf {
    PathBuf::from("logs/requests.jsonl")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_max_files() -> usize {
    5
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml(&text, base)
    }

    pub fn from_toml(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let mut value: toml::Value = toml::from_str(text)?;
        substitute_env(&mut value);
        let mut config: Config = value.try_into()?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base_dir.join(&*p);
            }
        };
        resolve(&mut self.security.deny_list_file);
        resolve(&mut self.security.auto_keywords_file);
        resolve(&mut self.security.prompt_file);
        resolve(&mut self.ledger.path);
        resolve(&mut self.audit.path);
        if let Some(log_path) = self.monitoring.log_path.as_mut() {
            resolve(log_path);
        }
        if let Some(log_file) = self.logging.file.as_mut() {
            resolve(log_file);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require_secret("llm.api_key", &self.llm.api_key)?;
        if let Some(slack) = &self.slack {
            require_secret("slack.webhook_url", &slack.webhook_url)?;
        }
        if self.monitoring.source == SourceKind::File && self.monitoring.log_path.is_none() {
            return Err(ConfigError::Invalid(
                "monitoring.log_path is required when monitoring.source = \"file\"".to_string(),
            ));
        }
        if self.monitoring.source == SourceKind::Journal && self.monitoring.error_levels.is_empty()
        {
            return Err(ConfigError::Invalid(
                "monitoring.error_levels must not be empty".to_string(),
            ));
        }
        if self.monitoring.max_concurrent_events == 0 {
            return Err(ConfigError::Invalid(
                "monitoring.max_concurrent_events must be positive".to_string(),
            ));
        }
        if self.logging.file.is_some() && self.logging.max_files == 0 {
            return Err(ConfigError::Invalid(
                "logging.max_files must be positive".to_string(),
            ));
        }
        if self.security.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "security.command_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn require_secret(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() || is_placeholder(value) {
        return Err(ConfigError::MissingSecret {
            field,
            placeholder: value.to_string(),
        });
    }
    Ok(())
}

fn is_placeholder(value: &str) -> bool {
    value.starts_with("${") && value.ends_with('}')
}

/// Replaces every string of the exact form `${VAR}` with the value of `VAR`, leaving it
/// untouched when the variable is unset.
fn substitute_env(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => {
            if is_placeholder(s) {
                if let Ok(resolved) = std::env::var(&s[2..s.len() - 1]) {
                    *s = resolved;
                }
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(substitute_env),
        toml::Value::Table(table) => table.iter_mut().for_each(|(_, v)| substitute_env(v)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[security]
deny_list_file = "deny_list.txt"
command_timeout_secs = 20

[monitoring]
source = "file"
log_path = "/var/log/app.log"

[llm]
api_key = "${SRE_AGENT_TEST_API_KEY}"

[slack]
webhook_url = "https://hooks.example.com/T000/B000"
"#;

    #[test]
    fn loads_with_defaults_and_substitution() {
        std::env::set_var("SRE_AGENT_TEST_API_KEY", "secret-key");
        let config = Config::from_toml(SAMPLE, Path::new("/etc/sre-agent")).unwrap();

        assert_eq!(config.llm.api_key, "secret-key");
        assert_eq!(config.llm.model, "gemini-2.0-flash");
        assert_eq!(config.security.command_timeout(), Duration::from_secs(20));
        assert_eq!(
            config.security.deny_list_file,
            PathBuf::from("/etc/sre-agent/deny_list.txt")
        );
        assert_eq!(
            config.monitoring.log_path,
            Some(PathBuf::from("/var/log/app.log"))
        );
        assert_eq!(config.monitoring.error_keywords, vec!["ERROR", "CRITICAL", "FATAL"]);
        assert_eq!(config.slack.unwrap().username, "sre-agent");
        assert_eq!(config.monitoring.max_concurrent_events, 1);
        assert_eq!(config.logging.file, None);
        assert_eq!(config.logging.rotation, LogRotation::Daily);
    }

    #[test]
    fn substitutes_placeholders_in_nested_tables_and_arrays() {
        std::env::set_var("SRE_AGENT_TEST_WEBHOOK", "https://hooks.example.com/T1");
        std::env::set_var("SRE_AGENT_TEST_KEYWORD", "PANIC");
        let text = r#"
[monitoring]
source = "file"
log_path = "/var/log/app.log"
error_keywords = ["ERROR", "${SRE_AGENT_TEST_KEYWORD}"]

[llm]
api_key = "k"

[slack]
webhook_url = "${SRE_AGENT_TEST_WEBHOOK}"
"#;
        let config = Config::from_toml(text, Path::new(".")).unwrap();
        assert_eq!(config.monitoring.error_keywords, vec!["ERROR", "PANIC"]);
        assert_eq!(config.slack.unwrap().webhook_url, "https://hooks.example.com/T1");
    }

    #[test]
    fn logging_file_and_event_limit_keys() {
        let text = r#"
[monitoring]
source = "journal"
max_concurrent_events = 3

[llm]
api_key = "k"

[logging]
level = "debug"
json = true
file = "logs/agent.log"
rotation = "hourly"
max_files = 7
"#;
        let config = Config::from_toml(text, Path::new("/srv/agent")).unwrap();
        assert_eq!(config.monitoring.max_concurrent_events, 3);
        assert_eq!(
            config.logging.file,
            Some(PathBuf::from("/srv/agent/logs/agent.log"))
        );
        assert_eq!(config.logging.rotation, LogRotation::Hourly);
        assert_eq!(config.logging.max_files, 7);
        assert!(config.logging.json);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let text = r#"
[monitoring]
source = "journal"
max_concurrent_events = 0

[llm]
api_key = "k"
"#;
        let err = Config::from_toml(text, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_events"));

        let text = r#"
[monitoring]
source = "journal"

[llm]
api_key = "k"

[logging]
file = "agent.log"
max_files = 0
"#;
        let err = Config::from_toml(text, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("max_files"));
    }

    #[test]
    fn unset_secret_is_an_error() {
        let text = SAMPLE.replace("SRE_AGENT_TEST_API_KEY", "SRE_AGENT_TEST_UNSET_VAR");
        let err = Config::from_toml(&text, Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret { field: "llm.api_key", .. }));
    }

    #[test]
    fn file_source_requires_log_path() {
        let text = r#"
[monitoring]
source = "file"

[llm]
api_key = "k"
"#;
        let err = Config::from_toml(text, Path::new(".")).unwrap_err();
        assert!(err.to_string().contains("log_path"));
    }

    #[test]
    fn rejects_unknown_keys() {
        let text = r#"
[monitoring]
source = "journal"
surprise = true

[llm]
api_key = "k"
"#;
        assert!(matches!(
            Config::from_toml(text, Path::new(".")),
            Err(ConfigError::Parse(_))
        ));
    }
}
