use anyhow::Result;
use invitrack_core::TrackerConfig;
use invitrack_models::gateway::{DEFAULT_INTENTS, INTENT_GUILD_INVITES, INTENT_GUILD_MEMBERS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub grace: GraceConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PlatformConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Bot token. Prefer `INVITRACK_TOKEN` over writing it here.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Gateway intents bitmask sent with IDENTIFY.
    #[serde(default = "default_intents")]
    pub intents: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            gateway_url: default_gateway_url(),
            token: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            intents: default_intents(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Full rebuild period of the expiry index.
    #[serde(default = "default_recompute_interval_secs")]
    pub recompute_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            recompute_interval_secs: default_recompute_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GraceConfig {
    #[serde(default = "default_grace_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_grace_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            period_secs: default_grace_period_secs(),
            poll_interval_secs: default_grace_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".into()
}
fn default_gateway_url() -> String {
    "wss://gateway.discord.gg/?v=10&encoding=json".into()
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_intents() -> u64 {
    DEFAULT_INTENTS
}
fn default_recompute_interval_secs() -> u64 {
    1500
}
fn default_grace_period_secs() -> u64 {
    300
}
fn default_grace_poll_interval_secs() -> u64 {
    1
}
fn default_event_capacity() -> usize {
    1024
}

fn looks_like_placeholder_token(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized.is_empty()
        || normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.starts_with("example")
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Invitrack Configuration
# Generated automatically on first run. Edit as needed.

[platform]
api_base = "{api_base}"
gateway_url = "{gateway_url}"
# Bot token. Leave empty and set INVITRACK_TOKEN instead.
token = ""
request_timeout_secs = {timeout}
# GUILDS | GUILD_MEMBERS | GUILD_INVITES
intents = {intents}

[scheduler]
# Full rebuild of the expiry index, in seconds.
recompute_interval_secs = {recompute}

[grace]
# How long a vanished server keeps its invites before they are dropped.
period_secs = {grace}
poll_interval_secs = {poll}

[events]
capacity = {capacity}

[logging]
# "pretty" or "json"
format = "pretty"
"#,
        api_base = config.platform.api_base,
        gateway_url = config.platform.gateway_url,
        timeout = config.platform.request_timeout_secs,
        intents = config.platform.intents,
        recompute = config.scheduler.recompute_interval_secs,
        grace = config.grace.period_secs,
        poll = config.grace.poll_interval_secs,
        capacity = config.events.capacity,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            Self::from_toml(&content)?
        } else {
            tracing::info!(
                "Config file not found at '{}', generating defaults...",
                path
            );
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };
        // The file may hold the bot token.
        let _ = harden_secret_file_permissions(path);

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("INVITRACK_TOKEN") {
            self.platform.token = value;
        }
        if let Ok(value) = std::env::var("INVITRACK_API_BASE") {
            self.platform.api_base = value;
        }
        if let Ok(value) = std::env::var("INVITRACK_GATEWAY_URL") {
            self.platform.gateway_url = value;
        }
        if let Ok(value) = std::env::var("INVITRACK_RECOMPUTE_INTERVAL_SECS") {
            match value.parse::<u64>() {
                Ok(parsed) => self.scheduler.recompute_interval_secs = parsed,
                Err(_) => tracing::warn!(
                    "Ignoring invalid INVITRACK_RECOMPUTE_INTERVAL_SECS value '{}'",
                    value
                ),
            }
        }
        if let Ok(value) = std::env::var("INVITRACK_GRACE_PERIOD_SECS") {
            match value.parse::<u64>() {
                Ok(parsed) => self.grace.period_secs = parsed,
                Err(_) => {
                    tracing::warn!("Ignoring invalid INVITRACK_GRACE_PERIOD_SECS value '{}'", value)
                }
            }
        }
    }

    /// Reject settings the tracker cannot start with.
    pub fn validate(&self) -> Result<()> {
        if looks_like_placeholder_token(&self.platform.token) {
            anyhow::bail!(
                "Missing platform.token: set INVITRACK_TOKEN or platform.token to the bot token"
            );
        }
        let required = INTENT_GUILD_MEMBERS | INTENT_GUILD_INVITES;
        if self.platform.intents & required != required {
            anyhow::bail!(
                "platform.intents must include GUILD_MEMBERS (2) and GUILD_INVITES (64), got {}",
                self.platform.intents
            );
        }
        if self.scheduler.recompute_interval_secs == 0 {
            anyhow::bail!("scheduler.recompute_interval_secs must be greater than zero");
        }
        if self.grace.poll_interval_secs == 0 {
            anyhow::bail!("grace.poll_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn tracker(&self) -> TrackerConfig {
        TrackerConfig {
            recompute_interval: Duration::from_secs(self.scheduler.recompute_interval_secs),
            grace_period: Duration::from_secs(self.grace.period_secs),
            grace_poll_interval: Duration::from_secs(self.grace.poll_interval_secs),
            event_capacity: self.events.capacity,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.platform.request_timeout_secs)
    }
}
