use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AgentError, AgentResult};
use crate::telemetry::attributes::AttributeValue;
use crate::telemetry::filter::FilterRule;

pub const DEFAULT_MAX_BUFFER_BYTES: u64 = 25 * 1024 * 1024;

/// Agent configuration. Immutable once the agent is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Reported as the `app` global attribute
    pub application_name: String,
    /// Reported as the `deployment.environment` global attribute when set
    pub deployment_environment: Option<String>,
    /// Log every exported span
    pub debug_enabled: bool,

    /// Persist buffered spans in SQLite instead of memory only
    pub disk_buffering_enabled: bool,
    pub database_path: String,
    /// Ceiling on buffered span bytes; oldest spans are evicted above it
    pub max_buffer_bytes: u64,

    pub session_inactivity_timeout_secs: u64,
    pub max_session_lifetime_secs: u64,
    /// Ratio of sessions whose spans are kept (0.0 - 1.0)
    pub session_sampling_ratio: f64,

    pub anr_detection_enabled: bool,
    pub stall_threshold_ms: u64,
    pub heartbeat_interval_ms: u64,

    pub flush_batch_size: usize,
    pub flush_interval_ms: u64,
    pub flush_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    /// Attributes stamped onto every span
    pub global_attributes: BTreeMap<String, AttributeValue>,
    /// Filter rules, applied in the listed order before export
    pub filters: Vec<FilterRule>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            application_name: "unknown".to_string(),
            deployment_environment: None,
            debug_enabled: false,
            disk_buffering_enabled: false,
            database_path: "./.rum/spans.db".to_string(),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            session_inactivity_timeout_secs: 15 * 60,
            max_session_lifetime_secs: 4 * 60 * 60,
            session_sampling_ratio: 1.0,
            anr_detection_enabled: true,
            stall_threshold_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            flush_batch_size: 100,
            flush_interval_ms: 5_000,
            flush_timeout_ms: 10_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            global_attributes: BTreeMap::new(),
            filters: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Build from `RUM_*` environment variables, falling back to defaults for
    /// anything unset. Values that fail to parse are rejected rather than
    /// silently replaced.
    pub fn from_env() -> AgentResult<Self> {
        let mut config = Self::default();

        if let Ok(name) = env::var("RUM_APPLICATION_NAME") {
            config.application_name = name;
        }
        if let Ok(environment) = env::var("RUM_DEPLOYMENT_ENVIRONMENT") {
            config.deployment_environment = Some(environment);
        }
        if let Ok(path) = env::var("RUM_DATABASE_PATH") {
            config.database_path = path;
        }

        env_override("RUM_DEBUG", &mut config.debug_enabled)?;
        env_override("RUM_DISK_BUFFERING", &mut config.disk_buffering_enabled)?;
        env_override("RUM_MAX_BUFFER_BYTES", &mut config.max_buffer_bytes)?;
        env_override(
            "RUM_SESSION_INACTIVITY_SECS",
            &mut config.session_inactivity_timeout_secs,
        )?;
        env_override("RUM_SESSION_MAX_LIFETIME_SECS", &mut config.max_session_lifetime_secs)?;
        env_override("RUM_SESSION_SAMPLING_RATIO", &mut config.session_sampling_ratio)?;
        env_override("RUM_ANR_DETECTION", &mut config.anr_detection_enabled)?;
        env_override("RUM_STALL_THRESHOLD_MS", &mut config.stall_threshold_ms)?;
        env_override("RUM_HEARTBEAT_INTERVAL_MS", &mut config.heartbeat_interval_ms)?;
        env_override("RUM_RETRY_BASE_DELAY_MS", &mut config.retry_base_delay_ms)?;
        env_override("RUM_RETRY_MAX_DELAY_MS", &mut config.retry_max_delay_ms)?;
        env_override("RUM_FLUSH_BATCH_SIZE", &mut config.flush_batch_size)?;
        env_override("RUM_FLUSH_INTERVAL_MS", &mut config.flush_interval_ms)?;
        env_override("RUM_FLUSH_TIMEOUT_MS", &mut config.flush_timeout_ms)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> AgentResult<Self> {
        let config: AgentConfig =
            toml::from_str(raw).map_err(|e| AgentError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks. Serde handles the syntax.
    pub fn validate(&self) -> AgentResult<()> {
        let mut problems = Vec::new();

        if self.max_buffer_bytes == 0 {
            problems.push("max_buffer_bytes must be positive".to_string());
        }
        if self.session_inactivity_timeout_secs == 0 {
            problems.push("session_inactivity_timeout_secs must be positive".to_string());
        }
        if self.max_session_lifetime_secs < self.session_inactivity_timeout_secs {
            problems.push(
                "max_session_lifetime_secs must not be shorter than the inactivity timeout"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.session_sampling_ratio) {
            problems.push(format!(
                "session_sampling_ratio {} must be within 0.0..=1.0",
                self.session_sampling_ratio
            ));
        }
        if self.anr_detection_enabled {
            if self.heartbeat_interval_ms == 0 {
                problems.push("heartbeat_interval_ms must be positive".to_string());
            }
            if self.stall_threshold_ms < self.heartbeat_interval_ms {
                problems.push(
                    "stall_threshold_ms must be at least one heartbeat interval".to_string(),
                );
            }
        }
        if self.flush_batch_size == 0 {
            problems.push("flush_batch_size must be positive".to_string());
        }
        if self.flush_interval_ms == 0 || self.flush_timeout_ms == 0 {
            problems.push("flush interval and timeout must be positive".to_string());
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            problems.push("retry_base_delay_ms exceeds retry_max_delay_ms".to_string());
        }
        if self.disk_buffering_enabled && self.database_path.trim().is_empty() {
            problems.push("database_path is required when disk buffering is enabled".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AgentError::InvalidConfig(problems.join(", ")))
        }
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.session_inactivity_timeout_secs)
    }

    pub fn max_session_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_session_lifetime_secs)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

fn env_override<T: FromStr>(key: &str, slot: &mut T) -> AgentResult<()> {
    match env::var(key) {
        Ok(raw) => {
            *slot = raw
                .trim()
                .parse()
                .map_err(|_| AgentError::InvalidConfig(format!("{} has invalid value '{}'", key, raw)))?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.inactivity_timeout(), Duration::from_secs(900));
        assert_eq!(config.stall_threshold(), Duration::from_secs(5));
        assert_eq!(config.max_buffer_bytes, 25 * 1024 * 1024);
    }

    #[test]
    fn test_from_toml_with_filters() {
        let raw = r#"
            application_name = "shop"
            deployment_environment = "staging"
            max_buffer_bytes = 4096
            session_inactivity_timeout_secs = 60

            [global_attributes]
            tier = "gold"
            build = 42

            [[filters]]
            kind = "reject_name"
            name = "health"

            [[filters]]
            kind = "remove_attribute"
            key = "pii"
        "#;

        let config = AgentConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.application_name, "shop");
        assert_eq!(config.deployment_environment.as_deref(), Some("staging"));
        assert_eq!(config.max_buffer_bytes, 4096);
        assert_eq!(config.filters.len(), 2);
        assert_eq!(
            config.global_attributes.get("build"),
            Some(&AttributeValue::Int(42))
        );
        // untouched fields keep their defaults
        assert_eq!(config.flush_batch_size, 100);
    }

    #[test]
    fn test_validation_collects_problems() {
        let config = AgentConfig {
            max_buffer_bytes: 0,
            session_sampling_ratio: 1.5,
            ..Default::default()
        };

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_buffer_bytes"));
        assert!(err.contains("session_sampling_ratio"));
    }

    #[test]
    fn test_stall_threshold_below_heartbeat_rejected() {
        let config = AgentConfig {
            stall_threshold_ms: 500,
            heartbeat_interval_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let disabled = AgentConfig {
            anr_detection_enabled: false,
            ..config
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = AgentConfig::from_toml_str("max_buffer_bytes = \"lots\"").unwrap_err();
        assert!(matches!(err, AgentError::InvalidConfig(_)));
    }
}
