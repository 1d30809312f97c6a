use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub typing: TypingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// Pre-chosen username; the client asks for one when absent.
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignInMethod {
    #[default]
    Anonymous,
    Token,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub method: SignInMethod,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    #[serde(default = "default_true")]
    pub correlate_sent: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            limit: default_history_limit(),
            correlate_sent: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypingConfig {
    #[serde(default = "default_quiet_period_ms")]
    pub quiet_period_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period_ms(),
        }
    }
}

impl TypingConfig {
    pub fn quiet_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.quiet_period_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    username: Option<String>,
    token: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_scope() -> String {
    "global".to_string()
}

fn default_history_limit() -> usize {
    MAX_HISTORY_LIMIT
}

fn default_quiet_period_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Largest snapshot the durable history source hands to the engine.
pub const MAX_HISTORY_LIMIT: usize = 50;

const DEFAULT_CONFIG_TOML: &str = r#"[session]
# username = "alice"

[identity]
method = "anonymous"
# token = "uid:secret"

[history]
scope = "global"
limit = 50
correlate_sent = true

[typing]
quiet_period_ms = 2000

[logging]
level = "info"

[event_bus]
channel_capacity = 1024
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "parley", "parley") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Writes a default file on first run.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. Used by `load_config()` and tests.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            DEFAULT_CONFIG_TOML.to_string()
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        username: std::env::var("PARLEY_USERNAME").ok(),
        token: std::env::var("PARLEY_AUTH_TOKEN").ok(),
        log_level: std::env::var("PARLEY_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(username) = overrides.username.filter(|u| !u.trim().is_empty()) {
        config.session.username = Some(username);
    }
    if let Some(token) = overrides.token.filter(|t| !t.is_empty()) {
        config.identity.token = Some(token);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.identity.method == SignInMethod::Token
        && config.identity.token.as_deref().is_none_or(str::is_empty)
    {
        return Err(ConfigError::MissingRequiredFields {
            fields: vec!["identity.token".to_string()],
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    if config.history.scope.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "history.scope".to_string(),
            message: "must not be empty".to_string(),
        });
    }

    if !(1..=MAX_HISTORY_LIMIT).contains(&config.history.limit) {
        return Err(ConfigError::InvalidValue {
            field: "history.limit".to_string(),
            message: format!("must be between 1 and {MAX_HISTORY_LIMIT}"),
        });
    }

    if config.typing.quiet_period_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "typing.quiet_period_ms".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(())
}

fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    tracing::info!(path = %path.display(), "wrote default configuration");
    Ok(())
}
