use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::workflow::{AgentId, WorkflowType};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub assistant: AssistantConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub classification_temperature: f32,
}

#[derive(Clone, Debug)]
pub struct AssistantConfig {
    pub routing_agent_id: String,
    pub general_agent_id: String,
    pub resident_info_agent_id: String,
    pub space_agent_id: String,
    pub help_agent_id: String,
    pub conversation_expiration_minutes: u64,
    pub sweep_interval_secs: u64,
    pub max_tool_rounds: u32,
    pub store_conversations: bool,
    /// Purges every agent context at startup. Development profiles only.
    pub dev_reset_on_startup: bool,
    pub require_direct_message_for_space: bool,
    /// When off, reservation and payment tools degrade to the web portal.
    pub mutating_tools_enabled: bool,
    pub history_window_messages: usize,
    pub history_window_minutes: u64,
    pub short_followup_max_chars: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub max_concurrent_events: usize,
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
    Mistral,
    OpenAi,
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
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub conversation_expiration_minutes: Option<u64>,
    pub max_tool_rounds: Option<u32>,
    pub dev_reset_on_startup: Option<bool>,
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
            llm: LlmConfig {
                provider: LlmProvider::Mistral,
                api_key: None,
                base_url: None,
                model: "mistral-small-latest".to_string(),
                timeout_secs: 60,
                max_retries: 2,
                classification_temperature: 0.1,
            },
            assistant: AssistantConfig {
                routing_agent_id: "concierge-routing".to_string(),
                general_agent_id: "concierge-general".to_string(),
                resident_info_agent_id: "concierge-resident-info".to_string(),
                space_agent_id: "concierge-space".to_string(),
                help_agent_id: "concierge-help".to_string(),
                conversation_expiration_minutes: 10,
                sweep_interval_secs: 60,
                max_tool_rounds: 3,
                store_conversations: true,
                dev_reset_on_startup: false,
                require_direct_message_for_space: true,
                mutating_tools_enabled: true,
                history_window_messages: 10,
                history_window_minutes: 15,
                short_followup_max_chars: 18,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                max_concurrent_events: 64,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl LlmProvider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Mistral => "https://api.mistral.ai/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mistral" => Ok(Self::Mistral),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected mistral|openai|ollama)"
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

impl LlmConfig {
    pub fn resolved_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl AssistantConfig {
    /// Remote agent bound to each workflow. HELP and SUPPORT share the help agent.
    pub fn agent_for(&self, workflow: WorkflowType) -> AgentId {
        let id = match workflow {
            WorkflowType::General => &self.general_agent_id,
            WorkflowType::ResidentInfo => &self.resident_info_agent_id,
            WorkflowType::Space => &self.space_agent_id,
            WorkflowType::Help | WorkflowType::Support => &self.help_agent_id,
        };
        AgentId(id.clone())
    }

    pub fn routing_agent(&self) -> AgentId {
        AgentId(self.routing_agent_id.clone())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
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
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("concierge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
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
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
            if let Some(temperature) = llm.classification_temperature {
                self.llm.classification_temperature = temperature;
            }
        }

        if let Some(assistant) = patch.assistant {
            let target = &mut self.assistant;
            if let Some(value) = assistant.routing_agent_id {
                target.routing_agent_id = value;
            }
            if let Some(value) = assistant.general_agent_id {
                target.general_agent_id = value;
            }
            if let Some(value) = assistant.resident_info_agent_id {
                target.resident_info_agent_id = value;
            }
            if let Some(value) = assistant.space_agent_id {
                target.space_agent_id = value;
            }
            if let Some(value) = assistant.help_agent_id {
                target.help_agent_id = value;
            }
            if let Some(value) = assistant.conversation_expiration_minutes {
                target.conversation_expiration_minutes = value;
            }
            if let Some(value) = assistant.sweep_interval_secs {
                target.sweep_interval_secs = value;
            }
            if let Some(value) = assistant.max_tool_rounds {
                target.max_tool_rounds = value;
            }
            if let Some(value) = assistant.store_conversations {
                target.store_conversations = value;
            }
            if let Some(value) = assistant.dev_reset_on_startup {
                target.dev_reset_on_startup = value;
            }
            if let Some(value) = assistant.require_direct_message_for_space {
                target.require_direct_message_for_space = value;
            }
            if let Some(value) = assistant.mutating_tools_enabled {
                target.mutating_tools_enabled = value;
            }
            if let Some(value) = assistant.history_window_messages {
                target.history_window_messages = value;
            }
            if let Some(value) = assistant.history_window_minutes {
                target.history_window_minutes = value;
            }
            if let Some(value) = assistant.short_followup_max_chars {
                target.short_followup_max_chars = value;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(max_concurrent_events) = server.max_concurrent_events {
                self.server.max_concurrent_events = max_concurrent_events;
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
        if let Some(value) = read_env("CONCIERGE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CONCIERGE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("CONCIERGE_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_ASSISTANT_ROUTING_AGENT_ID") {
            self.assistant.routing_agent_id = value;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_GENERAL_AGENT_ID") {
            self.assistant.general_agent_id = value;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_RESIDENT_INFO_AGENT_ID") {
            self.assistant.resident_info_agent_id = value;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_SPACE_AGENT_ID") {
            self.assistant.space_agent_id = value;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_HELP_AGENT_ID") {
            self.assistant.help_agent_id = value;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_CONVERSATION_EXPIRATION_MINUTES") {
            self.assistant.conversation_expiration_minutes =
                parse_u64("CONCIERGE_ASSISTANT_CONVERSATION_EXPIRATION_MINUTES", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_SWEEP_INTERVAL_SECS") {
            self.assistant.sweep_interval_secs =
                parse_u64("CONCIERGE_ASSISTANT_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_MAX_TOOL_ROUNDS") {
            self.assistant.max_tool_rounds =
                parse_u32("CONCIERGE_ASSISTANT_MAX_TOOL_ROUNDS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_STORE_CONVERSATIONS") {
            self.assistant.store_conversations =
                parse_bool("CONCIERGE_ASSISTANT_STORE_CONVERSATIONS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_MUTATING_TOOLS_ENABLED") {
            self.assistant.mutating_tools_enabled =
                parse_bool("CONCIERGE_ASSISTANT_MUTATING_TOOLS_ENABLED", &value)?;
        }

        let dev_reset = read_env("CONCIERGE_ASSISTANT_DEV_RESET_ON_STARTUP")
            .map(|value| ("CONCIERGE_ASSISTANT_DEV_RESET_ON_STARTUP", value))
            .or_else(|| read_env("CONCIERGE_DEV_MODE").map(|value| ("CONCIERGE_DEV_MODE", value)));
        if let Some((key, value)) = dev_reset {
            self.assistant.dev_reset_on_startup = parse_bool(key, &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
                    key: "CONCIERGE_SERVER_HEALTH_CHECK_PORT".to_string(),
                    value: value.clone(),
                })?;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_MAX_CONCURRENT_EVENTS") {
            self.server.max_concurrent_events =
                parse_usize("CONCIERGE_SERVER_MAX_CONCURRENT_EVENTS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("CONCIERGE_LOGGING_LEVEL").or_else(|| read_env("CONCIERGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONCIERGE_LOGGING_FORMAT").or_else(|| read_env("CONCIERGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(minutes) = overrides.conversation_expiration_minutes {
            self.assistant.conversation_expiration_minutes = minutes;
        }
        if let Some(rounds) = overrides.max_tool_rounds {
            self.assistant.max_tool_rounds = rounds;
        }
        if let Some(reset) = overrides.dev_reset_on_startup {
            self.assistant.dev_reset_on_startup = reset;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_assistant(&self.assistant)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
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

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if !(0.0..=1.0).contains(&llm.classification_temperature) {
        return Err(ConfigError::Validation(
            "llm.classification_temperature must be in range 0.0..=1.0".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::Mistral | LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for mistral/openai providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {}
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_assistant(assistant: &AssistantConfig) -> Result<(), ConfigError> {
    let agent_ids = [
        ("assistant.routing_agent_id", &assistant.routing_agent_id),
        ("assistant.general_agent_id", &assistant.general_agent_id),
        ("assistant.resident_info_agent_id", &assistant.resident_info_agent_id),
        ("assistant.space_agent_id", &assistant.space_agent_id),
        ("assistant.help_agent_id", &assistant.help_agent_id),
    ];
    if let Some((key, _)) = agent_ids.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(ConfigError::Validation(format!("{key} must not be empty")));
    }

    if assistant.conversation_expiration_minutes == 0 {
        return Err(ConfigError::Validation(
            "assistant.conversation_expiration_minutes must be greater than zero".to_string(),
        ));
    }

    if assistant.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "assistant.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }

    if assistant.max_tool_rounds == 0 || assistant.max_tool_rounds > 10 {
        return Err(ConfigError::Validation(
            "assistant.max_tool_rounds must be in range 1..=10".to_string(),
        ));
    }

    if assistant.history_window_messages == 0 {
        return Err(ConfigError::Validation(
            "assistant.history_window_messages must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.bind_address.trim().is_empty() {
        return Err(ConfigError::Validation("server.bind_address must not be empty".to_string()));
    }

    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.max_concurrent_events == 0 {
        return Err(ConfigError::Validation(
            "server.max_concurrent_events must be greater than zero".to_string(),
        ));
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

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    assistant: Option<AssistantPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    classification_temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct AssistantPatch {
    routing_agent_id: Option<String>,
    general_agent_id: Option<String>,
    resident_info_agent_id: Option<String>,
    space_agent_id: Option<String>,
    help_agent_id: Option<String>,
    conversation_expiration_minutes: Option<u64>,
    sweep_interval_secs: Option<u64>,
    max_tool_rounds: Option<u32>,
    store_conversations: Option<bool>,
    dev_reset_on_startup: Option<bool>,
    require_direct_message_for_space: Option<bool>,
    mutating_tools_enabled: Option<bool>,
    history_window_messages: Option<usize>,
    history_window_minutes: Option<u64>,
    short_followup_max_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    max_concurrent_events: Option<usize>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};
    use crate::domain::workflow::WorkflowType;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_MISTRAL_KEY", "key-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "mistral"
api_key = "${TEST_MISTRAL_KEY}"

[assistant]
space_agent_id = "ag-space-01"
conversation_expiration_minutes = 20
mutating_tools_enabled = false
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "key-from-env")
                    == Some(true),
                "api key should be loaded from environment",
            )?;
            ensure(
                config.assistant.agent_for(WorkflowType::Space).0 == "ag-space-01",
                "space agent id should come from file",
            )?;
            ensure(
                config.assistant.conversation_expiration_minutes == 20,
                "expiration should come from file",
            )?;
            ensure(!config.assistant.mutating_tools_enabled, "mutating tools switched off in file")?;
            Ok(())
        })();

        clear_vars(&["TEST_MISTRAL_KEY"]);
        result
    }

    #[test]
    fn defaults_match_assistant_timings() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LLM_API_KEY", "key-test");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.assistant.conversation_expiration_minutes == 10, "10 minute expiry")?;
            ensure(config.assistant.sweep_interval_secs == 60, "60 second sweep")?;
            ensure(config.assistant.max_tool_rounds == 3, "3 tool rounds")?;
            ensure(!config.assistant.dev_reset_on_startup, "dev reset off by default")?;
            ensure(config.assistant.mutating_tools_enabled, "mutating tools on by default")?;
            ensure(
                config.llm.resolved_base_url() == "https://api.mistral.ai/v1",
                "mistral base url by default",
            )?;
            ensure(
                config.assistant.agent_for(WorkflowType::Support)
                    == config.assistant.agent_for(WorkflowType::Help),
                "support shares the help agent",
            )?;
            Ok(())
        })();

        clear_vars(&["CONCIERGE_LLM_API_KEY"]);
        result
    }

    #[test]
    fn dev_mode_and_logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LLM_API_KEY", "key-test");
        env::set_var("CONCIERGE_DEV_MODE", "true");
        env::set_var("CONCIERGE_LOG_LEVEL", "warn");
        env::set_var("CONCIERGE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.assistant.dev_reset_on_startup, "dev mode alias should enable reset")?;
            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "CONCIERGE_LLM_API_KEY",
            "CONCIERGE_DEV_MODE",
            "CONCIERGE_LOG_LEVEL",
            "CONCIERGE_LOG_FORMAT",
        ]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LLM_MODEL", "model-from-env");
        env::set_var("CONCIERGE_ASSISTANT_MAX_TOOL_ROUNDS", "5");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("concierge.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "ollama"
model = "model-from-file"

[assistant]
max_tool_rounds = 2

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    log_level: Some("debug".to_string()),
                    max_tool_rounds: Some(4),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::Ollama, "provider from file")?;
            ensure(config.llm.model == "model-from-env", "env model should win over file")?;
            ensure(config.assistant.max_tool_rounds == 4, "override should win over env")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            Ok(())
        })();

        clear_vars(&["CONCIERGE_LLM_MODEL", "CONCIERGE_ASSISTANT_MAX_TOOL_ROUNDS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        clear_vars(&["CONCIERGE_LLM_API_KEY"]);

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => return Err("expected validation failure but config load succeeded".to_string()),
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("llm.api_key")
        );
        ensure(has_message, "validation failure should mention llm.api_key")
    }

    #[test]
    fn invalid_numeric_override_is_reported_with_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LLM_API_KEY", "key-test");
        env::set_var("CONCIERGE_ASSISTANT_SWEEP_INTERVAL_SECS", "every-minute");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected invalid override".to_string()),
            Err(ConfigError::InvalidEnvOverride { key, .. }) => ensure(
                key == "CONCIERGE_ASSISTANT_SWEEP_INTERVAL_SECS",
                "error should name the offending variable",
            ),
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_vars(&["CONCIERGE_LLM_API_KEY", "CONCIERGE_ASSISTANT_SWEEP_INTERVAL_SECS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CONCIERGE_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["CONCIERGE_LLM_API_KEY"]);
        result
    }
}
