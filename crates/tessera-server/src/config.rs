use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::tuple::TenantId;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub rest: RestConfig,
    pub log: LogConfig,
    pub engine: EngineConfigValues,
    pub schema: SchemaLimitsConfig,
    pub authn: AuthnConfig,
    pub tracing: TracingConfig,
    pub gc: GcConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RestConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    /// Tenant served by the HTTP surface. Nil when unset.
    pub tenant_id: Option<uuid::Uuid>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfigValues {
    pub max_depth: u32,
    pub check_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchemaLimitsConfig {
    pub max_entities: usize,
    pub max_relations_per_entity: usize,
    pub max_permissions_per_entity: usize,
    pub max_source_bytes: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthnConfig {
    pub enabled: bool,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    pub enabled: bool,
    pub otlp_endpoint: String,
    pub service_name: String,
    pub sample_rate: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Tombstones younger than this many transactions survive compaction.
    pub retain_snapshots: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3476,
            max_body_bytes: 4 * 1024 * 1024,
            tenant_id: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl Default for EngineConfigValues {
    fn default() -> Self {
        Self {
            max_depth: 50,
            check_timeout_ms: 5_000,
        }
    }
}

impl Default for SchemaLimitsConfig {
    fn default() -> Self {
        let limits = tessera_core::schema::SchemaLimits::default();
        Self {
            max_entities: limits.max_entities,
            max_relations_per_entity: limits.max_relations_per_entity,
            max_permissions_per_entity: limits.max_permissions_per_entity,
            max_source_bytes: limits.max_source_bytes,
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: "http://localhost:4317".to_string(),
            service_name: "tessera".to_string(),
            sample_rate: 1.0,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            retain_snapshots: 1_000,
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TESSERA_REST_HOST") {
            self.rest.host = v;
        }
        if let Ok(v) = std::env::var("TESSERA_REST_PORT")
            && let Ok(port) = v.parse()
        {
            self.rest.port = port;
        }
        if let Ok(v) = std::env::var("TESSERA_ENGINE_MAX_DEPTH")
            && let Ok(n) = v.parse()
        {
            self.engine.max_depth = n;
        }
        if let Ok(v) = std::env::var("TESSERA_ENGINE_CHECK_TIMEOUT_MS")
            && let Ok(n) = v.parse()
        {
            self.engine.check_timeout_ms = n;
        }
        if let Ok(v) = std::env::var("TESSERA_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("TESSERA_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("TESSERA_AUTHN_KEYS") {
            self.authn.keys = v
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
            self.authn.enabled = !self.authn.keys.is_empty();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rest.port == 0 {
            return Err(ConfigError::Validation(
                "rest.port must be non-zero".to_string(),
            ));
        }
        if self.engine.max_depth == 0 {
            return Err(ConfigError::Validation(
                "engine.max_depth must be non-zero".to_string(),
            ));
        }
        if self.engine.check_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "engine.check_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.authn.enabled && self.authn.keys.is_empty() {
            return Err(ConfigError::Validation(
                "authn.keys must not be empty when authn is enabled".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.tracing.sample_rate) {
            return Err(ConfigError::Validation(
                "tracing.sample_rate must be between 0 and 1".to_string(),
            ));
        }
        if self.gc.enabled && self.gc.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "gc.interval_secs must be non-zero when gc is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_engine_config(&self) -> tessera_core::engine::EngineConfig {
        tessera_core::engine::EngineConfig {
            max_depth: self.engine.max_depth,
        }
    }

    pub fn to_schema_limits(&self) -> tessera_core::schema::SchemaLimits {
        tessera_core::schema::SchemaLimits {
            max_entities: self.schema.max_entities,
            max_relations_per_entity: self.schema.max_relations_per_entity,
            max_permissions_per_entity: self.schema.max_permissions_per_entity,
            max_source_bytes: self.schema.max_source_bytes,
        }
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.check_timeout_ms)
    }

    pub fn default_tenant(&self) -> TenantId {
        TenantId::new(self.rest.tenant_id.unwrap_or_else(uuid::Uuid::nil))
    }

    pub fn rest_addr(&self) -> String {
        format!("{}:{}", self.rest.host, self.rest.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}
