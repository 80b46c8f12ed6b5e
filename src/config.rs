use std::{
    collections::{HashMap, HashSet},
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{IncidentCard, McpTool, Resource};

pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration `{0}`")]
    InvalidDuration(String),
    #[error("unknown watcher type `{kind}` for watcher {watcher}")]
    UnknownWatcherType { watcher: String, kind: String },
    #[error("resource {resource} not found for watcher {watcher}")]
    UnknownResource { watcher: String, resource: String },
    #[error("duplicate {section} entry `{name}`")]
    Duplicate { section: &'static str, name: String },
    #[error("incident card {card} has malformed tool `{tool}`, expected server.tool")]
    MalformedTool { card: String, tool: String },
    #[error("stdio MCP server {0} has no command")]
    MissingCommand(String),
    #[error("streamable MCP server {0} has no url")]
    MissingUrl(String),
    #[error("OPENAI_API_KEY is not set and {0} is not a local endpoint")]
    MissingApiKey(String),
}

/// A label filter value: either one exact string or a set of accepted strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(String),
    Any(Vec<String>),
}

impl FilterValue {
    pub fn accepts(&self, candidate: &str) -> bool {
        match self {
            Self::One(expected) => expected == candidate,
            Self::Any(options) => options.iter().any(|option| option == candidate),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceConfig {
    pub name: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub filters: HashMap<String, FilterValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatcherConfig {
    pub r#type: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    #[serde(default)]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct McpServerConfig {
    pub name: String,
    /// `stdio` (spawned when `auto-start` is set) or `streamable` (always
    /// connected to `url`).
    #[serde(default = "default_server_type")]
    pub r#type: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auto_start: bool,
}

impl McpServerConfig {
    #[cfg(test)]
    pub fn stdio(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            r#type: default_server_type(),
            command: command.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            work_dir: None,
            url: None,
            timeout: None,
            env: HashMap::new(),
            auto_start: true,
        }
    }

    /// Handshake timeout. Unparseable values fall back to the default.
    pub fn timeout(&self) -> Duration {
        self.timeout
            .as_deref()
            .and_then(|raw| parse_duration(raw).ok())
            .unwrap_or(DEFAULT_SERVER_TIMEOUT)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IncidentCardConfig {
    #[serde(default)]
    pub name: String,
    pub resource: String,
    #[serde(alias = "prompt-template")]
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub max_iterations: usize,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub sinks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SinkConfig {
    pub name: String,
    #[serde(default = "default_sink_type")]
    pub r#type: String,
    #[serde(default = "default_sink_level")]
    pub level: String,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OpenAiOverrides {
    pub model: Option<String>,
    pub url: Option<String>,
    pub temperature: Option<f32>,
}

/// The YAML document describing what to watch and how to investigate it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub watchers: Vec<WatcherConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub incident_cards: Vec<IncidentCardConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub openai: OpenAiOverrides,
    #[serde(default)]
    pub default_max_iterations: Option<usize>,
}

impl FileConfig {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let parsed: Self = serde_yaml::from_str(raw).context("Failed to parse YAML config")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_unique("resources", self.resources.iter().map(|r| r.name.as_str()))?;
        ensure_unique("watchers", self.watchers.iter().map(|w| w.name.as_str()))?;
        ensure_unique("mcp-servers", self.mcp_servers.iter().map(|s| s.name.as_str()))?;

        let known: HashSet<&str> = self.resources.iter().map(|r| r.name.as_str()).collect();
        for watcher in &self.watchers {
            if watcher.r#type != "prometheus" {
                return Err(ConfigError::UnknownWatcherType {
                    watcher: watcher.name.clone(),
                    kind: watcher.r#type.clone(),
                });
            }
            parse_duration(&watcher.poll_interval)?;
            if let Some(missing) = watcher
                .resources
                .iter()
                .find(|name| !known.contains(name.as_str()))
            {
                return Err(ConfigError::UnknownResource {
                    watcher: watcher.name.clone(),
                    resource: missing.clone(),
                });
            }
        }

        for server in &self.mcp_servers {
            if server.r#type == "stdio" && server.command.trim().is_empty() {
                return Err(ConfigError::MissingCommand(server.name.clone()));
            }
            let has_url = server.url.as_deref().is_some_and(|url| !url.trim().is_empty());
            if server.r#type == "streamable" && !has_url {
                return Err(ConfigError::MissingUrl(server.name.clone()));
            }
        }

        for card in &self.incident_cards {
            if let Some(bad) = card.tools.iter().find(|raw| McpTool::parse(raw).is_none()) {
                return Err(ConfigError::MalformedTool {
                    card: card_name(card),
                    tool: bad.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|resource| resource.name == name)
    }

    /// Incident cards bound to their resource names, with iteration budgets resolved.
    pub fn incident_cards(&self, default_max_iterations: usize) -> Vec<IncidentCard> {
        let fallback = self
            .default_max_iterations
            .filter(|value| *value > 0)
            .unwrap_or(default_max_iterations);

        self.incident_cards
            .iter()
            .map(|card| IncidentCard {
                name: card_name(card),
                resource: Resource {
                    name: card.resource.clone(),
                    ..Default::default()
                },
                prompt: card.prompt.clone(),
                tools: card.tools.iter().filter_map(|raw| McpTool::parse(raw)).collect(),
                max_iterations: if card.max_iterations == 0 {
                    fallback
                } else {
                    card.max_iterations
                },
                model: card.model.clone(),
                sinks: card.sinks.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub config_path: Option<PathBuf>,
    pub log_json: bool,
    pub openai: OpenAiConfig,
    pub queue_capacity: usize,
    pub worker_concurrency: usize,
    pub dedupe_ttl_seconds: u64,
    pub dedupe_max_entries: usize,
    pub default_max_iterations: usize,
    pub file: FileConfig,
}

impl Config {
    /// Reads scalars from the environment and the pipeline definition from YAML.
    ///
    /// The YAML path is the first CLI argument, or `MCP_SENTINEL_CONFIG`.
    pub fn from_env(cli_config_path: Option<String>) -> Result<Self> {
        let bind_raw =
            env::var("MCP_SENTINEL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_addr = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let config_path = cli_config_path
            .or_else(|| env::var("MCP_SENTINEL_CONFIG").ok())
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from);

        let file = match &config_path {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let log_json = env::var("MCP_SENTINEL_LOG_FORMAT")
            .map(|v| v.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let base_url = file
            .openai
            .url
            .clone()
            .or_else(|| env::var("OPENAI_BASE_URL").ok())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let api_key = env::var("OPENAI_API_KEY")
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        if api_key.is_empty() && !is_local_endpoint(&base_url) {
            return Err(ConfigError::MissingApiKey(base_url).into());
        }
        let model = file
            .openai
            .model
            .clone()
            .or_else(|| env::var("OPENAI_MODEL").ok())
            .unwrap_or_else(|| "gpt-4o".to_string());

        Ok(Self {
            bind_addr,
            config_path,
            log_json,
            openai: OpenAiConfig {
                api_key,
                base_url,
                model,
                temperature: file.openai.temperature,
            },
            queue_capacity: env_parse("MCP_SENTINEL_QUEUE_CAPACITY", 100).max(1),
            worker_concurrency: env_parse("MCP_SENTINEL_WORKER_CONCURRENCY", 1).max(1),
            dedupe_ttl_seconds: env_parse("MCP_SENTINEL_DEDUPE_TTL_SECONDS", 600),
            dedupe_max_entries: env_parse("MCP_SENTINEL_DEDUPE_MAX_ENTRIES", 10_000).max(1),
            default_max_iterations: env_parse(
                "MCP_SENTINEL_DEFAULT_MAX_ITERATIONS",
                DEFAULT_MAX_ITERATIONS,
            )
            .max(1),
            file,
        })
    }
}

/// Parses Go-style durations such as `30s`, `1m30s` or `250ms`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    let mut rest = raw.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        let amount: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit_nanos = match &rest[..unit_len] {
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        let nanos = amount * unit_nanos;
        if !nanos.is_finite() || nanos >= u64::MAX as f64 {
            return Err(invalid());
        }
        total = total
            .checked_add(Duration::from_nanos(nanos as u64))
            .ok_or_else(invalid)?;
    }

    Ok(total)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn is_local_endpoint(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1")
}

fn card_name(card: &IncidentCardConfig) -> String {
    if card.name.trim().is_empty() {
        card.resource.clone()
    } else {
        card.name.clone()
    }
}

fn ensure_unique<'a>(
    section: &'static str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::Duplicate {
                section,
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

fn default_poll_interval() -> String {
    "30s".to_string()
}

fn default_server_type() -> String {
    "stdio".to_string()
}

fn default_sink_type() -> String {
    "log".to_string()
}

fn default_sink_level() -> String {
    "info".to_string()
}
