use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub channel: ChannelConfig,
    pub llm: LlmConfig,
    pub engagement: EngagementConfig,
    pub queue: QueueConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub api_url: String,
    pub api_token: SecretString,
    /// Address messages are sent from, as registered with the provider.
    pub sender: String,
    pub send_timeout_secs: u64,
    pub recipient_min_digits: usize,
    pub recipient_max_digits: usize,
    pub max_message_length: usize,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    /// How many prior messages accompany an interpretation request.
    pub history_limit: u32,
    /// Reply used when interpretation times out or the provider degrades.
    pub fallback_reply: String,
}

#[derive(Clone, Debug)]
pub struct EngagementConfig {
    pub max_cycles: u32,
    pub window_hours: u32,
    pub opening_template: String,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub base_delay_secs: i64,
    pub backoff_multiplier: u32,
    pub claim_timeout_secs: i64,
    pub inbound_concurrency: usize,
    pub outbound_concurrency: usize,
    pub poll_interval_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub webhook_secret: Option<SecretString>,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub channel_api_url: Option<String>,
    pub channel_api_token: Option<String>,
    pub channel_sender: Option<String>,
    pub webhook_secret: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://winback.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            channel: ChannelConfig {
                api_url: "http://localhost:8081".to_string(),
                api_token: String::new().into(),
                sender: String::new(),
                send_timeout_secs: 10,
                recipient_min_digits: 10,
                recipient_max_digits: 15,
                max_message_length: 4096,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 12,
                history_limit: 10,
                fallback_reply:
                    "Desculpe, tive um problema para processar sua mensagem. Pode tentar novamente \
                     em instantes?"
                        .to_string(),
            },
            engagement: EngagementConfig {
                max_cycles: 3,
                window_hours: 24,
                opening_template: "abandoned_cart_opening".to_string(),
            },
            queue: QueueConfig {
                max_attempts: 5,
                base_delay_secs: 5,
                backoff_multiplier: 2,
                claim_timeout_secs: 300,
                inbound_concurrency: 5,
                outbound_concurrency: 10,
                poll_interval_ms: 500,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                webhook_secret: None,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("winback.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(channel) = patch.channel {
            if let Some(api_url) = channel.api_url {
                self.channel.api_url = api_url;
            }
            if let Some(api_token_value) = channel.api_token {
                self.channel.api_token = secret_value(api_token_value);
            }
            if let Some(sender) = channel.sender {
                self.channel.sender = sender;
            }
            if let Some(send_timeout_secs) = channel.send_timeout_secs {
                self.channel.send_timeout_secs = send_timeout_secs;
            }
            if let Some(recipient_min_digits) = channel.recipient_min_digits {
                self.channel.recipient_min_digits = recipient_min_digits;
            }
            if let Some(recipient_max_digits) = channel.recipient_max_digits {
                self.channel.recipient_max_digits = recipient_max_digits;
            }
            if let Some(max_message_length) = channel.max_message_length {
                self.channel.max_message_length = max_message_length;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(history_limit) = llm.history_limit {
                self.llm.history_limit = history_limit;
            }
            if let Some(fallback_reply) = llm.fallback_reply {
                self.llm.fallback_reply = fallback_reply;
            }
        }

        if let Some(engagement) = patch.engagement {
            if let Some(max_cycles) = engagement.max_cycles {
                self.engagement.max_cycles = max_cycles;
            }
            if let Some(window_hours) = engagement.window_hours {
                self.engagement.window_hours = window_hours;
            }
            if let Some(opening_template) = engagement.opening_template {
                self.engagement.opening_template = opening_template;
            }
        }

        if let Some(queue) = patch.queue {
            if let Some(max_attempts) = queue.max_attempts {
                self.queue.max_attempts = max_attempts;
            }
            if let Some(base_delay_secs) = queue.base_delay_secs {
                self.queue.base_delay_secs = base_delay_secs;
            }
            if let Some(backoff_multiplier) = queue.backoff_multiplier {
                self.queue.backoff_multiplier = backoff_multiplier;
            }
            if let Some(claim_timeout_secs) = queue.claim_timeout_secs {
                self.queue.claim_timeout_secs = claim_timeout_secs;
            }
            if let Some(inbound_concurrency) = queue.inbound_concurrency {
                self.queue.inbound_concurrency = inbound_concurrency;
            }
            if let Some(outbound_concurrency) = queue.outbound_concurrency {
                self.queue.outbound_concurrency = outbound_concurrency;
            }
            if let Some(poll_interval_ms) = queue.poll_interval_ms {
                self.queue.poll_interval_ms = poll_interval_ms;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(webhook_secret_value) = server.webhook_secret {
                self.server.webhook_secret = Some(secret_value(webhook_secret_value));
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("WINBACK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("WINBACK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("WINBACK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("WINBACK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("WINBACK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("WINBACK_CHANNEL_API_URL") {
            self.channel.api_url = value;
        }
        if let Some(value) = read_env("WINBACK_CHANNEL_API_TOKEN") {
            self.channel.api_token = secret_value(value);
        }
        if let Some(value) = read_env("WINBACK_CHANNEL_SENDER") {
            self.channel.sender = value;
        }
        if let Some(value) = read_env("WINBACK_CHANNEL_SEND_TIMEOUT_SECS") {
            self.channel.send_timeout_secs =
                parse_u64("WINBACK_CHANNEL_SEND_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("WINBACK_CHANNEL_RECIPIENT_MIN_DIGITS") {
            self.channel.recipient_min_digits =
                parse_usize("WINBACK_CHANNEL_RECIPIENT_MIN_DIGITS", &value)?;
        }
        if let Some(value) = read_env("WINBACK_CHANNEL_RECIPIENT_MAX_DIGITS") {
            self.channel.recipient_max_digits =
                parse_usize("WINBACK_CHANNEL_RECIPIENT_MAX_DIGITS", &value)?;
        }
        if let Some(value) = read_env("WINBACK_CHANNEL_MAX_MESSAGE_LENGTH") {
            self.channel.max_message_length =
                parse_usize("WINBACK_CHANNEL_MAX_MESSAGE_LENGTH", &value)?;
        }

        if let Some(value) = read_env("WINBACK_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("WINBACK_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("WINBACK_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("WINBACK_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("WINBACK_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("WINBACK_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("WINBACK_LLM_HISTORY_LIMIT") {
            self.llm.history_limit = parse_u32("WINBACK_LLM_HISTORY_LIMIT", &value)?;
        }
        if let Some(value) = read_env("WINBACK_LLM_FALLBACK_REPLY") {
            self.llm.fallback_reply = value;
        }

        if let Some(value) = read_env("WINBACK_ENGAGEMENT_MAX_CYCLES") {
            self.engagement.max_cycles = parse_u32("WINBACK_ENGAGEMENT_MAX_CYCLES", &value)?;
        }
        if let Some(value) = read_env("WINBACK_ENGAGEMENT_WINDOW_HOURS") {
            self.engagement.window_hours = parse_u32("WINBACK_ENGAGEMENT_WINDOW_HOURS", &value)?;
        }
        if let Some(value) = read_env("WINBACK_ENGAGEMENT_OPENING_TEMPLATE") {
            self.engagement.opening_template = value;
        }

        if let Some(value) = read_env("WINBACK_QUEUE_MAX_ATTEMPTS") {
            self.queue.max_attempts = parse_u32("WINBACK_QUEUE_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("WINBACK_QUEUE_BASE_DELAY_SECS") {
            self.queue.base_delay_secs = parse_i64("WINBACK_QUEUE_BASE_DELAY_SECS", &value)?;
        }
        if let Some(value) = read_env("WINBACK_QUEUE_BACKOFF_MULTIPLIER") {
            self.queue.backoff_multiplier = parse_u32("WINBACK_QUEUE_BACKOFF_MULTIPLIER", &value)?;
        }
        if let Some(value) = read_env("WINBACK_QUEUE_CLAIM_TIMEOUT_SECS") {
            self.queue.claim_timeout_secs = parse_i64("WINBACK_QUEUE_CLAIM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("WINBACK_QUEUE_INBOUND_CONCURRENCY") {
            self.queue.inbound_concurrency =
                parse_usize("WINBACK_QUEUE_INBOUND_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("WINBACK_QUEUE_OUTBOUND_CONCURRENCY") {
            self.queue.outbound_concurrency =
                parse_usize("WINBACK_QUEUE_OUTBOUND_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("WINBACK_QUEUE_POLL_INTERVAL_MS") {
            self.queue.poll_interval_ms = parse_u64("WINBACK_QUEUE_POLL_INTERVAL_MS", &value)?;
        }

        if let Some(value) = read_env("WINBACK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("WINBACK_SERVER_PORT") {
            self.server.port = parse_u16("WINBACK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("WINBACK_SERVER_WEBHOOK_SECRET") {
            self.server.webhook_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("WINBACK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("WINBACK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("WINBACK_LOGGING_LEVEL").or_else(|| read_env("WINBACK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("WINBACK_LOGGING_FORMAT").or_else(|| read_env("WINBACK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(channel_api_url) = overrides.channel_api_url {
            self.channel.api_url = channel_api_url;
        }
        if let Some(channel_api_token) = overrides.channel_api_token {
            self.channel.api_token = secret_value(channel_api_token);
        }
        if let Some(channel_sender) = overrides.channel_sender {
            self.channel.sender = channel_sender;
        }
        if let Some(webhook_secret) = overrides.webhook_secret {
            self.server.webhook_secret = Some(secret_value(webhook_secret));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_channel(&self.channel)?;
        validate_llm(&self.llm)?;
        validate_engagement(&self.engagement)?;
        validate_queue(&self.queue)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    if let Some(env_path) = read_env("WINBACK_CONFIG_PATH") {
        let path = PathBuf::from(env_path);
        return path.exists().then_some(path);
    }

    [PathBuf::from("winback.toml"), PathBuf::from("config/winback.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_channel(channel: &ChannelConfig) -> Result<(), ConfigError> {
    if !channel.api_url.starts_with("http://") && !channel.api_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "channel.api_url must start with http:// or https://".to_string(),
        ));
    }

    if channel.api_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "channel.api_token is required. Use WINBACK_CHANNEL_API_TOKEN or the [channel] \
             section of winback.toml"
                .to_string(),
        ));
    }

    if channel.sender.trim().is_empty() {
        return Err(ConfigError::Validation(
            "channel.sender is required (the provider-registered sender address)".to_string(),
        ));
    }

    if channel.send_timeout_secs == 0 || channel.send_timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "channel.send_timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if channel.recipient_min_digits < 5 || channel.recipient_min_digits > channel.recipient_max_digits
    {
        return Err(ConfigError::Validation(
            "channel.recipient_min_digits must be at least 5 and no greater than \
             channel.recipient_max_digits"
                .to_string(),
        ));
    }

    if channel.recipient_max_digits > 20 {
        return Err(ConfigError::Validation(
            "channel.recipient_max_digits must be at most 20".to_string(),
        ));
    }

    if channel.max_message_length == 0 || channel.max_message_length > 4096 {
        return Err(ConfigError::Validation(
            "channel.max_message_length must be in range 1..=4096".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.history_limit == 0 || llm.history_limit > 50 {
        return Err(ConfigError::Validation(
            "llm.history_limit must be in range 1..=50".to_string(),
        ));
    }

    if llm.fallback_reply.trim().is_empty() {
        return Err(ConfigError::Validation("llm.fallback_reply must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_engagement(engagement: &EngagementConfig) -> Result<(), ConfigError> {
    if engagement.max_cycles == 0 {
        return Err(ConfigError::Validation(
            "engagement.max_cycles must be greater than zero".to_string(),
        ));
    }

    if engagement.window_hours == 0 || engagement.window_hours > 168 {
        return Err(ConfigError::Validation(
            "engagement.window_hours must be in range 1..=168".to_string(),
        ));
    }

    if engagement.opening_template.trim().is_empty() {
        return Err(ConfigError::Validation(
            "engagement.opening_template must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_queue(queue: &QueueConfig) -> Result<(), ConfigError> {
    if queue.max_attempts == 0 || queue.max_attempts > 20 {
        return Err(ConfigError::Validation(
            "queue.max_attempts must be in range 1..=20".to_string(),
        ));
    }

    if queue.base_delay_secs < 0 || queue.base_delay_secs > 3600 {
        return Err(ConfigError::Validation(
            "queue.base_delay_secs must be in range 0..=3600".to_string(),
        ));
    }

    if queue.backoff_multiplier == 0 {
        return Err(ConfigError::Validation(
            "queue.backoff_multiplier must be greater than zero".to_string(),
        ));
    }

    if queue.claim_timeout_secs <= 0 || queue.claim_timeout_secs > 3600 {
        return Err(ConfigError::Validation(
            "queue.claim_timeout_secs must be in range 1..=3600".to_string(),
        ));
    }

    if queue.inbound_concurrency == 0 || queue.inbound_concurrency > 64 {
        return Err(ConfigError::Validation(
            "queue.inbound_concurrency must be in range 1..=64".to_string(),
        ));
    }

    if queue.outbound_concurrency == 0 || queue.outbound_concurrency > 64 {
        return Err(ConfigError::Validation(
            "queue.outbound_concurrency must be in range 1..=64".to_string(),
        ));
    }

    if queue.poll_interval_ms < 10 || queue.poll_interval_ms > 60_000 {
        return Err(ConfigError::Validation(
            "queue.poll_interval_ms must be in range 10..=60000".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    channel: Option<ChannelPatch>,
    llm: Option<LlmPatch>,
    engagement: Option<EngagementPatch>,
    queue: Option<QueuePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelPatch {
    api_url: Option<String>,
    api_token: Option<String>,
    sender: Option<String>,
    send_timeout_secs: Option<u64>,
    recipient_min_digits: Option<usize>,
    recipient_max_digits: Option<usize>,
    max_message_length: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    history_limit: Option<u32>,
    fallback_reply: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EngagementPatch {
    max_cycles: Option<u32>,
    window_hours: Option<u32>,
    opening_template: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct QueuePatch {
    max_attempts: Option<u32>,
    base_delay_secs: Option<i64>,
    backoff_multiplier: Option<u32>,
    claim_timeout_secs: Option<i64>,
    inbound_concurrency: Option<usize>,
    outbound_concurrency: Option<usize>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    webhook_secret: Option<String>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
