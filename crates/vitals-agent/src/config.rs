//! Agent configuration: a YAML file layered with CLI/env overrides, validated
//! once at startup and then shared immutably.

use crate::constants;
use crate::error::ConfigError;
use crate::event::Category;
use crate::paths::{self, StatePaths};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Opaque device identity used for attribution and batch ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the buffer does with a new event when a category is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new event with `BufferFull`; stored events are kept.
    #[default]
    RejectNew,
    /// Evict the oldest stored event to make room.
    DropOldest,
}

/// Where the device id travels on upload requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceIdPlacement {
    /// `X-Device-Id` request header.
    #[default]
    Header,
    /// `deviceId` field in the JSON body.
    Body,
}

/// Full agent configuration. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub api_endpoint: String,
    pub api_port: u16,
    pub api_path: String,
    pub health_endpoint: String,
    pub device_id: DeviceIdentity,
    pub device_id_placement: DeviceIdPlacement,
    pub upload_batch_size: usize,
    pub uploads_per_hour: u32,
    pub samples_per_minute: u32,
    pub pings_per_minute: u32,
    pub buffer_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub degraded_threshold: u32,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub state_dir: PathBuf,
    /// Directory holding the per-category inbox files. Defaults to `state_dir`.
    pub inbox_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_endpoint: constants::API_ENDPOINT.to_string(),
            api_port: constants::API_PORT,
            api_path: constants::API_PATH.to_string(),
            health_endpoint: constants::HEALTH_ENDPOINT.to_string(),
            device_id: DeviceIdentity::default(),
            device_id_placement: DeviceIdPlacement::default(),
            upload_batch_size: constants::UPLOAD_BATCH_SIZE,
            uploads_per_hour: constants::UPLOADS_PER_HOUR,
            samples_per_minute: constants::SAMPLES_PER_MINUTE,
            pings_per_minute: constants::PINGS_PER_MINUTE,
            buffer_capacity: constants::BUFFER_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            degraded_threshold: constants::DEGRADED_THRESHOLD,
            connect_timeout_secs: constants::HTTP_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: constants::HTTP_TIMEOUT_SECS,
            state_dir: PathBuf::from(constants::STATE_DIR),
            inbox_dir: None,
        }
    }
}

/// Values supplied on the command line or through the environment. Each one
/// that is set replaces the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub device_id: Option<String>,
    pub api_endpoint: Option<String>,
    pub api_port: Option<u16>,
    pub state_dir: Option<PathBuf>,
}

impl AgentConfig {
    /// Read, override and validate. `path = None` starts from defaults.
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_yaml_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without validating. An empty document yields the defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml_ng::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(content)
    }

    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(id) = &overrides.device_id {
            self.device_id = DeviceIdentity::new(id.clone());
        }
        if let Some(endpoint) = &overrides.api_endpoint {
            self.api_endpoint = endpoint.clone();
        }
        if let Some(port) = overrides.api_port {
            self.api_port = port;
        }
        if let Some(dir) = &overrides.state_dir {
            self.state_dir = dir.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let device_id = self.device_id.as_str().trim();
        if device_id.is_empty() {
            return Err(ConfigError::MissingDeviceId);
        }
        if device_id == constants::DEVICE_ID_PLACEHOLDER
            || device_id.starts_with('<')
            || device_id.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(invalid(
                "device_id",
                format!("'{}' is not a provisioned device id", self.device_id),
            ));
        }

        let endpoint = self.api_endpoint.trim();
        if endpoint.is_empty() {
            return Err(invalid("api_endpoint", "must not be empty"));
        }
        if endpoint.contains("://") || endpoint.contains('/') || endpoint.contains(' ') {
            return Err(invalid(
                "api_endpoint",
                format!("'{endpoint}' must be a bare host name without scheme or path"),
            ));
        }
        if self.api_port == 0 {
            return Err(invalid("api_port", "must be non-zero"));
        }
        if !self.api_path.starts_with('/') || !self.api_path.ends_with('/') {
            return Err(invalid(
                "api_path",
                format!("'{}' must start and end with '/'", self.api_path),
            ));
        }
        if !self.health_endpoint.starts_with('/') {
            return Err(invalid(
                "health_endpoint",
                format!("'{}' must start with '/'", self.health_endpoint),
            ));
        }

        for (field, value) in [
            ("uploads_per_hour", self.uploads_per_hour),
            ("samples_per_minute", self.samples_per_minute),
            ("pings_per_minute", self.pings_per_minute),
            ("degraded_threshold", self.degraded_threshold),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be at least 1"));
            }
        }
        if self.upload_batch_size == 0 {
            return Err(invalid("upload_batch_size", "must be at least 1"));
        }
        if self.buffer_capacity < self.upload_batch_size {
            return Err(invalid(
                "buffer_capacity",
                format!(
                    "{} is smaller than upload_batch_size {}",
                    self.buffer_capacity, self.upload_batch_size
                ),
            ));
        }
        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(invalid("timeouts", "connect and request timeouts must be at least 1s"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.api_endpoint, self.api_port)
    }

    /// Upload URL for one category.
    pub fn category_url(&self, category: Category) -> String {
        format!("{}{}{}", self.base_url(), self.api_path, category.route())
    }

    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_endpoint)
    }

    /// Ingestion cadence: one poll per allowed sample.
    pub fn ingest_interval(&self) -> Duration {
        per_period(Duration::from_secs(60), self.samples_per_minute)
    }

    /// Upload cadence: one tick per allowed upload.
    pub fn upload_interval(&self) -> Duration {
        per_period(Duration::from_secs(3600), self.uploads_per_hour)
    }

    pub fn ping_interval(&self) -> Duration {
        per_period(Duration::from_secs(60), self.pings_per_minute)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn paths(&self) -> StatePaths {
        StatePaths::new(self.state_dir.clone())
    }

    pub fn inbox_dir(&self) -> &Path {
        self.inbox_dir.as_deref().unwrap_or(&self.state_dir)
    }

    pub fn inbox_path(&self, category: Category) -> PathBuf {
        self.inbox_dir().join(paths::inbox_file_name(category))
    }
}

fn per_period(period: Duration, count: u32) -> Duration {
    period / count.max(1)
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_device(id: &str) -> AgentConfig {
        AgentConfig {
            device_id: DeviceIdentity::new(id),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn defaults_match_device_constants() {
        let c = AgentConfig::default();
        assert_eq!(c.api_endpoint, "breadwinner.life");
        assert_eq!(c.api_port, 80);
        assert_eq!(c.api_path, "/api/v1/");
        assert_eq!(c.health_endpoint, "/health");
        assert_eq!(c.upload_batch_size, 25);
        assert_eq!(c.uploads_per_hour, 4);
        assert_eq!(c.samples_per_minute, 4);
        assert_eq!(c.pings_per_minute, 1);
    }

    #[test]
    fn urls_are_built_from_parts() {
        let c = with_device("dev-1");
        assert_eq!(
            c.category_url(Category::Vitals),
            "http://breadwinner.life:80/api/v1/vitals"
        );
        assert_eq!(
            c.category_url(Category::Feeding),
            "http://breadwinner.life:80/api/v1/feedings"
        );
        assert_eq!(c.health_url(), "http://breadwinner.life:80/health");
    }

    #[test]
    fn cadences_follow_quotas() {
        let c = with_device("dev-1");
        assert_eq!(c.ingest_interval(), Duration::from_secs(15));
        assert_eq!(c.upload_interval(), Duration::from_secs(900));
        assert_eq!(c.ping_interval(), Duration::from_secs(60));
    }

    #[test]
    fn missing_device_id_is_rejected() {
        let err = AgentConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingDeviceId));
    }

    #[test]
    fn placeholder_device_id_is_rejected() {
        let err = with_device("<YOUR DEVICE_ID>").validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "device_id", .. }));
    }

    #[test]
    fn endpoint_with_scheme_is_rejected() {
        let mut c = with_device("dev-1");
        c.api_endpoint = "http://breadwinner.life".into();
        let err = c.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "api_endpoint", .. }));
    }

    #[test]
    fn zero_quota_is_rejected() {
        let mut c = with_device("dev-1");
        c.uploads_per_hour = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn capacity_below_batch_size_is_rejected() {
        let mut c = with_device("dev-1");
        c.buffer_capacity = 10;
        let err = c.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "buffer_capacity", .. }));
    }

    #[test]
    fn yaml_overrides_defaults() {
        let c = AgentConfig::from_yaml_str(
            "device_id: crib-42\napi_port: 8080\noverflow_policy: drop_oldest\ndevice_id_placement: body\n",
        )
        .unwrap();
        assert_eq!(c.device_id.as_str(), "crib-42");
        assert_eq!(c.api_port, 8080);
        assert_eq!(c.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(c.device_id_placement, DeviceIdPlacement::Body);
        assert_eq!(c.upload_batch_size, 25);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(AgentConfig::from_yaml_str("device_id: a\nbatch: 3\n").is_err());
    }

    #[test]
    fn empty_yaml_is_defaults() {
        assert_eq!(AgentConfig::from_yaml_str("").unwrap(), AgentConfig::default());
    }

    #[test]
    fn overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "device_id: from-file\napi_port: 8080\n").unwrap();
        let overrides = ConfigOverrides {
            device_id: Some("from-cli".into()),
            api_port: Some(9090),
            ..ConfigOverrides::default()
        };
        let c = AgentConfig::load(Some(&path), &overrides).unwrap();
        assert_eq!(c.device_id.as_str(), "from-cli");
        assert_eq!(c.api_port, 9090);
    }

    #[test]
    fn inbox_defaults_under_state_dir() {
        let mut c = with_device("dev-1");
        c.state_dir = PathBuf::from("/data/agent");
        assert_eq!(
            c.inbox_path(Category::Vitals),
            PathBuf::from("/data/agent/inbox-vitals.jsonl")
        );
        c.inbox_dir = Some(PathBuf::from("/run/sensors"));
        assert_eq!(
            c.inbox_path(Category::Feeding),
            PathBuf::from("/run/sensors/inbox-feedings.jsonl")
        );
    }
}
