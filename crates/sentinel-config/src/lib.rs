//! Environment-backed configuration.
//!
//! Everything is optional with sensible defaults except `OPENROUTER_API_KEY`,
//! which both model clients need; a missing credential fails startup with a
//! pointed message rather than surfacing later as a 401 mid-incident.

use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_FAST_MODEL: &str = "llama-4-scout-17b-16e-instruct";
const DEFAULT_DEEP_MODEL: &str = "meta-llama/llama-4-scout";
const DEFAULT_GATEWAY_URL: &str = "http://localhost:8811";
const DEFAULT_COMPOSE_FILE: &str = "docker-compose.yml";

/// Credentials and model ids for the OpenRouter-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_key: String,
    pub base_url: String,
    /// Small, fast model for log classification (routed to Cerebras).
    pub fast_model: String,
    /// Long-context model for root-cause analysis.
    pub deep_model: String,
}

impl ModelSettings {
    pub fn from_env() -> Result<Self> {
        let api_key = match env::var("OPENROUTER_API_KEY") {
            Ok(key) if !key.trim().is_empty() => key,
            _ => bail!(
                "OPENROUTER_API_KEY is not set; both model clients need it. \
                 Export it or add it to your environment before starting."
            ),
        };
        Ok(Self {
            api_key,
            base_url: env_or("OPENROUTER_BASE_URL", DEFAULT_OPENROUTER_BASE_URL),
            fast_model: env_or("CEREBRAS_MODEL", DEFAULT_FAST_MODEL),
            deep_model: env_or("LLAMA_MODEL", DEFAULT_DEEP_MODEL),
        })
    }
}

/// MCP gateway connection settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub gateway_url: String,
    pub timeout: Duration,
    /// When false, `execute_fix` short-circuits every fix to a structured
    /// refusal without touching the network. The safe default for a first
    /// deployment is to leave healing on but it can be switched off fleet-wide.
    pub auto_heal_enabled: bool,
}

impl GatewaySettings {
    pub fn from_env() -> Result<Self> {
        let timeout_secs: u64 = parse_env("MCP_TIMEOUT", 30)?;
        Ok(Self {
            gateway_url: env_or("MCP_GATEWAY_URL", DEFAULT_GATEWAY_URL),
            timeout: Duration::from_secs(timeout_secs),
            auto_heal_enabled: env_or("AUTO_HEAL_ENABLED", "true").trim().to_lowercase() == "true",
        })
    }
}

/// Redis backing for the event bus.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub max_connections: u32,
}

impl RedisSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_or("REDIS_HOST", "localhost"),
            port: parse_env("REDIS_PORT", 6379)?,
            db: parse_env("REDIS_DB", 0)?,
            password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            max_connections: parse_env("REDIS_MAX_CONNECTIONS", 10)?,
        })
    }

    /// Connection URL in the form `redis://[:password@]host:port/db`.
    #[must_use]
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Log-pump and sampler tuning.
#[derive(Debug, Clone)]
pub struct ObserverSettings {
    /// Anomaly check fires after this many fresh lines...
    pub log_lines_per_check: usize,
    /// ...or after this long, whichever comes first.
    pub log_check_interval: Duration,
    /// Compose descriptor handed to the deep analyzer, if readable.
    pub compose_file: PathBuf,
}

impl ObserverSettings {
    pub fn from_env() -> Result<Self> {
        let interval: f64 = parse_env("LOG_CHECK_INTERVAL", 5.0)?;
        if !interval.is_finite() || interval <= 0.0 {
            bail!("LOG_CHECK_INTERVAL must be a positive number of seconds");
        }
        Ok(Self {
            log_lines_per_check: parse_env("LOG_LINES_PER_CHECK", 20)?,
            log_check_interval: Duration::from_secs_f64(interval),
            compose_file: PathBuf::from(env_or("COMPOSE_FILE", DEFAULT_COMPOSE_FILE)),
        })
    }
}

/// Telemetry surface bind address.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub host: String,
    pub port: u16,
}

impl ApiSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env_or("API_HOST", "0.0.0.0"),
            port: parse_env("API_PORT", 8000)?,
        })
    }
}

/// The full settings tree, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub models: ModelSettings,
    pub gateway: GatewaySettings,
    pub redis: RedisSettings,
    pub observer: ObserverSettings,
    pub api: ApiSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            models: ModelSettings::from_env()?,
            gateway: GatewaySettings::from_env()?,
            redis: RedisSettings::from_env()?,
            observer: ObserverSettings::from_env()?,
            api: ApiSettings::from_env()?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
