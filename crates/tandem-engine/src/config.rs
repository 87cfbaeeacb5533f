//! Engine configuration loaded from JSON.
//!
//! Every section has defaults, so a config file only lists what it changes:
//!
//! ```json
//! {
//!   "physics": { "gravity": { "x": 0.0, "y": 0.0 } },
//!   "render": null,
//!   "shutdown_attempts": 5
//! }
//! ```
//!
//! A `null` subsystem section disables that subsystem.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tandem_physics::PhysicsConfig;
use tandem_render::RenderConfig;
use tandem_sync::job::JobSystemConfig;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Job system settings shared by every consumer thread.
    pub jobs: JobSystemConfig,
    /// Physics subsystem, or `None` to run without one.
    pub physics: Option<PhysicsConfig>,
    /// Render subsystem, or `None` to run without one.
    pub render: Option<RenderConfig>,
    /// How many `terminate_all` rounds shutdown attempts before giving up.
    pub shutdown_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jobs: JobSystemConfig::default(),
            physics: Some(PhysicsConfig::default()),
            render: Some(RenderConfig::default()),
            shutdown_attempts: 3,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_attempts == 0 {
            return Err(ConfigError::Invalid {
                section: "engine",
                reason: "shutdown_attempts must be at least 1".into(),
            });
        }
        if self.jobs.terminate_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                section: "jobs",
                reason: "terminate_timeout_ms must be non-zero".into(),
            });
        }
        if let Some(physics) = &self.physics {
            physics.validate().map_err(|e| ConfigError::Invalid {
                section: "physics",
                reason: e.to_string(),
            })?;
        }
        if let Some(render) = &self.render {
            render.validate().map_err(|e| ConfigError::Invalid {
                section: "render",
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Errors from loading or validating an [`EngineConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file {}: {source}", path.display())]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON for this schema.
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("invalid {section} config: {reason}")]
    Invalid {
        /// Section holding the bad value.
        section: &'static str,
        /// What is wrong.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_queue::ring::OverflowPolicy;

    #[test]
    fn empty_document_gives_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn null_section_disables_subsystem() {
        let config = EngineConfig::from_json_str(r#"{ "render": null }"#).unwrap();
        assert!(config.render.is_none());
        assert!(config.physics.is_some());
    }

    #[test]
    fn nested_overrides() {
        let config = EngineConfig::from_json_str(
            r#"{
                "jobs": { "terminate_timeout_ms": 500 },
                "physics": { "queue": { "capacity": 32, "policy": "grow" } }
            }"#,
        )
        .unwrap();
        assert_eq!(config.jobs.terminate_timeout_ms, 500);
        let physics = config.physics.unwrap();
        assert_eq!(physics.queue.capacity, 32);
        assert_eq!(physics.queue.policy, OverflowPolicy::Grow);
    }

    #[test]
    fn invalid_values_name_their_section() {
        let err = EngineConfig::from_json_str(r#"{ "physics": { "fixed_dt": -1.0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "physics", .. }));

        let err = EngineConfig::from_json_str(r#"{ "shutdown_attempts": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { section: "engine", .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{ "render": { "queue": { "policy": "drop" } } }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = EngineConfig::from_path("/definitely/not/here/tandem.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("tandem.json"));
    }
}
