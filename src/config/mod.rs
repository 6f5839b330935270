//! Configuration for stages and the demo pipeline.
//!
//! A pipeline configuration lists stages by name with their concurrency,
//! queue capacity and fields. Files are JSON by default; a `.toml` extension
//! selects TOML.
//!
//! # Example
//!
//! ```toml
//! [[stages]]
//! name = "multiply-by-two"
//! concurrency = 10
//! fields = { amountToMultiply = 2 }
//!
//! [[stages]]
//! name = "multiply-by-four"
//! concurrency = 10
//! fields = { amountToMultiply = { amount_to_multiply = 4 } }
//!
//! [input]
//! count = 10
//! max_value = 100
//! ```

use crate::error::{Result, WorkersError};
use crate::pipeline::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default number of generated input items for the demo.
pub const DEFAULT_INPUT_COUNT: usize = 10;

/// Default exclusive upper bound for generated input values.
pub const DEFAULT_INPUT_MAX: i64 = 100;

/// Default log filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info,workers_rs=debug";

/// Name of the first demo stage.
pub const STAGE_MULTIPLY_BY_TWO: &str = "multiply-by-two";

/// Name of the second demo stage.
pub const STAGE_MULTIPLY_BY_FOUR: &str = "multiply-by-four";

/// Field consulted by both demo stages.
pub const FIELD_AMOUNT_TO_MULTIPLY: &str = "amountToMultiply";

/// Settings applied to one stage builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    /// Parallel instances (builder default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    /// Queue capacity (builder default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,

    /// Named fields attached before start
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
            capacity: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Generated input for the demo binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Number of items sent to the first stage
    pub count: usize,

    /// Exclusive upper bound of generated values
    pub max_value: i64,

    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_INPUT_COUNT,
            max_value: DEFAULT_INPUT_MAX,
            seed: None,
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Directory for daily-rotated log files; stdout only when absent
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
        }
    }
}

/// Whole pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    /// Two chained multiplier stages with ten instances each.
    fn default() -> Self {
        let mut four = BTreeMap::new();
        four.insert(
            "amount_to_multiply".to_string(),
            serde_json::Value::from(4),
        );

        Self {
            stages: vec![
                StageConfig::new(STAGE_MULTIPLY_BY_TWO)
                    .with_concurrency(10)
                    .with_field(FIELD_AMOUNT_TO_MULTIPLY, 2),
                StageConfig::new(STAGE_MULTIPLY_BY_FOUR)
                    .with_concurrency(10)
                    .with_field(
                        FIELD_AMOUNT_TO_MULTIPLY,
                        FieldValue::Object(serde_json::Value::Object(four.into_iter().collect())),
                    ),
            ],
            input: InputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

impl PipelineConfig {
    /// Look up a stage entry by name.
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The named stage's settings, or a bare entry when it is not listed.
    pub fn stage_or_default(&self, name: &str) -> StageConfig {
        self.stage(name)
            .cloned()
            .unwrap_or_else(|| StageConfig::new(name))
    }

    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WorkersError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        if is_toml(path) {
            toml::from_str(&content).map_err(|e| {
                WorkersError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })
        } else {
            serde_json::from_str(&content).map_err(|e| {
                WorkersError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })
        }
    }

    /// Load a configuration file, returning defaults if any error occurs
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the configuration, as TOML or JSON depending on the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WorkersError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| WorkersError::Serialization(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| WorkersError::Serialization(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            WorkersError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_has_two_multipliers() {
        let config = PipelineConfig::default();
        assert_eq!(config.stages.len(), 2);

        let two = config.stage(STAGE_MULTIPLY_BY_TWO).unwrap();
        assert_eq!(two.concurrency, Some(10));
        assert_eq!(two.fields[FIELD_AMOUNT_TO_MULTIPLY], FieldValue::Int(2));

        let four = config.stage(STAGE_MULTIPLY_BY_FOUR).unwrap();
        assert_eq!(four.fields[FIELD_AMOUNT_TO_MULTIPLY].type_name(), "object");
    }

    #[test]
    fn test_stage_or_default() {
        let config = PipelineConfig::default();
        let missing = config.stage_or_default("unknown");
        assert_eq!(missing.name, "unknown");
        assert!(missing.concurrency.is_none());
        assert!(missing.fields.is_empty());
    }

    #[test]
    fn test_json_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("pipeline.json");

        let mut config = PipelineConfig::default();
        config.input.seed = Some(7);
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_toml_file_is_parsed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(
            &path,
            r#"
[[stages]]
name = "scale"
concurrency = 3
capacity = 8
fields = { factor = 5, label = "x5", config = { amount_to_multiply = 4 } }

[input]
count = 25
"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        let stage = config.stage("scale").unwrap();
        assert_eq!(stage.concurrency, Some(3));
        assert_eq!(stage.capacity, Some(8));
        assert_eq!(stage.fields["factor"], FieldValue::Int(5));
        assert_eq!(stage.fields["label"].as_str(), Some("x5"));
        assert_eq!(stage.fields["config"].type_name(), "object");
        assert_eq!(config.input.count, 25);
        assert_eq!(config.input.max_value, DEFAULT_INPUT_MAX);
        assert_eq!(config.logging.filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let err = PipelineConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, WorkersError::Config(_)));

        let fallback = PipelineConfig::load_or_default(dir.path().join("absent.json"));
        assert_eq!(fallback, PipelineConfig::default());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PipelineConfig::load(&path),
            Err(WorkersError::Config(_))
        ));
    }
}
