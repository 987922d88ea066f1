use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub records: Records,
    #[serde(default)]
    pub assistant: Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

/// Where intern records are looked up by CIN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Records {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub sqlite_path: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub fixtures_path: Option<String>,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    #[serde(default = "default_anonymous_user_id")]
    pub anonymous_user_id: String,
    #[serde(default)]
    pub catalog_path: Option<String>,
}

impl Default for Assistant {
    fn default() -> Self {
        Self {
            anonymous_user_id: default_anonymous_user_id(),
            catalog_path: None,
        }
    }
}

fn default_lookup_timeout_ms() -> u64 {
    2_000
}

fn default_anonymous_user_id() -> String {
    "guest".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    let records = &cfg.records;
    match records.kind.as_str() {
        "memory" => {
            if records.sqlite_path.is_some() || records.endpoint.is_some() {
                return Err(ConfigError::UnsupportedConfig(
                    "records.sqlite_path and records.endpoint are not supported when records.type=memory"
                        .to_string(),
                ));
            }
        }
        "sqlite" => {
            if is_blank(records.sqlite_path.as_deref()) {
                return Err(ConfigError::UnsupportedConfig(
                    "records.sqlite_path is required when records.type=sqlite".to_string(),
                ));
            }
        }
        "http" => {
            if is_blank(records.endpoint.as_deref()) {
                return Err(ConfigError::UnsupportedConfig(
                    "records.endpoint is required when records.type=http".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "records.type={other} is not implemented; supported: memory, sqlite, http"
            )));
        }
    }
    if records.fixtures_path.is_some() && records.kind != "memory" {
        return Err(ConfigError::UnsupportedConfig(
            "records.fixtures_path is only supported when records.type=memory".to_string(),
        ));
    }
    if records.lookup_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "records.lookup_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.assistant.anonymous_user_id.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "assistant.anonymous_user_id must not be blank".to_string(),
        ));
    }
    Ok(())
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(|v| v.trim().is_empty()).unwrap_or(true)
}
