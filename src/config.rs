use std::{env, path::PathBuf, str::FromStr};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::{
    audit::AuditConfig,
    detection::ProcessorConfig,
    gateway::ThresholdPolicy,
    models::{ModelHandleConfig, SimulatorConfig},
    security::{AuthConfig, ConfiguredKey, RateLimiterConfig, ValidatorConfig},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimiterConfig,
    pub validation: ValidatorConfig,
    pub model: ModelConfig,
    pub fallback: SimulatorConfig,
    pub processing: ProcessingConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format {other:?}, expected pretty or json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub backend_url: Option<String>,  // Vision runtime; none means always simulate
    pub handle: ModelHandleConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub threshold: ThresholdPolicy,
    pub result: ProcessorConfig,
}

impl Config {
    /// Reads the process environment. Call `dotenv::dotenv()` first to honour a `.env` file.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup, starting from defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Config::default();

        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(host) = var("HOST") {
            config.server.host = host;
        }
        set_parsed(&var, "PORT", &mut config.server.port)?;
        set_parsed(&var, "LOG_FORMAT", &mut config.server.log_format)?;

        if let Some(keys) = var("GATEWAY_API_KEYS") {
            config.auth.keys = parse_api_keys(&keys)?;
        }

        set_parsed(&var, "RATE_LIMIT_WINDOW_SECONDS", &mut config.rate_limit.window_seconds)?;
        set_parsed(&var, "RATE_LIMIT_MAX_REQUESTS", &mut config.rate_limit.max_requests)?;

        set_parsed(&var, "VALIDATION_MIN_BYTES", &mut config.validation.min_bytes)?;
        set_parsed(&var, "VALIDATION_MAX_BYTES", &mut config.validation.max_bytes)?;
        set_parsed(&var, "VALIDATION_MIN_DIMENSION", &mut config.validation.min_dimension)?;
        set_parsed(&var, "VALIDATION_MAX_DIMENSION", &mut config.validation.max_dimension)?;

        config.model.backend_url = var("VISION_BACKEND_URL");
        set_parsed(&var, "MODEL_TIMEOUT_MS", &mut config.model.handle.timeout_ms)?;
        set_parsed(&var, "MODEL_MAX_CONCURRENT", &mut config.model.handle.max_concurrent)?;
        set_parsed(&var, "MODEL_QUEUE_BUDGET_MS", &mut config.model.handle.queue_budget_ms)?;
        set_parsed(&var, "MODEL_MAX_INVOCATIONS", &mut config.model.handle.max_invocations)?;

        set_parsed(&var, "FALLBACK_MAX_CONCURRENT", &mut config.fallback.max_concurrent)?;

        set_parsed(&var, "CONFIDENCE_DEFAULT", &mut config.processing.threshold.default)?;
        set_parsed(&var, "CONFIDENCE_MIN", &mut config.processing.threshold.min)?;
        set_parsed(&var, "CONFIDENCE_MAX", &mut config.processing.threshold.max)?;

        config.audit.log_path = var("AUDIT_LOG_PATH").map(PathBuf::from);
        set_parsed(&var, "AUDIT_CHANNEL_CAPACITY", &mut config.audit.channel_capacity)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let v = &self.validation;
        if v.min_bytes > v.max_bytes {
            bail!("VALIDATION_MIN_BYTES ({}) exceeds VALIDATION_MAX_BYTES ({})", v.min_bytes, v.max_bytes);
        }
        if v.min_dimension == 0 || v.min_dimension > v.max_dimension {
            bail!(
                "dimension bounds {}..={} are empty or start at zero",
                v.min_dimension,
                v.max_dimension
            );
        }

        let t = &self.processing.threshold;
        let ordered = 0.0 <= t.min && t.min <= t.default && t.default <= t.max && t.max <= 1.0;
        if !ordered || !t.default.is_finite() {
            bail!(
                "confidence bounds must satisfy 0 <= min <= default <= max <= 1, got {} / {} / {}",
                t.min,
                t.default,
                t.max
            );
        }

        if self.rate_limit.window_seconds == 0 || self.rate_limit.max_requests == 0 {
            bail!("rate limit window and request count must be positive");
        }
        if self.model.handle.timeout_ms == 0 {
            bail!("MODEL_TIMEOUT_MS must be positive");
        }
        if self.model.handle.max_concurrent == 0 || self.fallback.max_concurrent == 0 {
            bail!("concurrency limits must be positive");
        }
        if self.audit.channel_capacity == 0 {
            bail!("AUDIT_CHANNEL_CAPACITY must be positive");
        }
        Ok(())
    }
}

fn set_parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = var(key) {
        *slot = raw
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value {raw:?} for {key}"))?;
    }
    Ok(())
}

/// Parses `client_id:secret` pairs separated by commas.
fn parse_api_keys(raw: &str) -> anyhow::Result<Vec<ConfiguredKey>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (client_id, secret) = entry
                .split_once(':')
                .with_context(|| "GATEWAY_API_KEYS entries must look like client_id:secret")?;
            let (client_id, secret) = (client_id.trim(), secret.trim());
            if client_id.is_empty() || secret.is_empty() {
                bail!("GATEWAY_API_KEYS entry has an empty client id or secret");
            }
            Ok(ConfiguredKey {
                client_id: client_id.to_string(),
                secret: secret.to_string(),
            })
        })
        .collect()
}
