//! Configuration for the scoring pipeline.
//!
//! Loaded from YAML. Every field has a default, so an empty document is a
//! valid configuration for the local backends.

use crate::pipeline::RetryConfig;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("Failed to access config file {path}: {source}")]
    Io {
        /// The file path.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The document is not valid YAML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// A value is out of range or inconsistent with another.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Upper bound for every duration field, in seconds (30 days).
pub const MAX_DURATION_SECONDS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

/// Upper bound for `export.poll_multiplier`.
pub const MAX_POLL_MULTIPLIER: f64 = 10.0;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Overall wall-clock deadline for one run.
    #[serde(default = "default_deadline")]
    pub deadline_seconds: f64,

    /// How long a cancelled stage gets to stop its external work.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_seconds: f64,

    /// Time box for the final notification.
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_seconds: f64,

    /// IANA zone whose calendar date is the default run date.
    #[serde(default = "default_run_date_timezone")]
    pub run_date_timezone: Tz,

    /// Storage namespaces.
    #[serde(default)]
    pub namespaces: NamespaceConfig,

    /// Parameter-store key names.
    #[serde(default)]
    pub parameters: ParameterKeys,

    /// Export stage settings.
    #[serde(default)]
    pub export: ExportConfig,

    /// Compute stage settings.
    #[serde(default)]
    pub compute: ComputeConfig,

    /// Notify stage settings.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Local backend settings used by the CLI.
    #[serde(default)]
    pub local: LocalConfig,
}

const fn default_deadline() -> f64 {
    2.0 * 60.0 * 60.0
}

const fn default_cancel_grace() -> f64 {
    30.0
}

const fn default_notify_timeout() -> f64 {
    30.0
}

const fn default_run_date_timezone() -> Tz {
    chrono_tz::Europe::London
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            deadline_seconds: default_deadline(),
            cancel_grace_seconds: default_cancel_grace(),
            notify_timeout_seconds: default_notify_timeout(),
            run_date_timezone: default_run_date_timezone(),
            namespaces: NamespaceConfig::default(),
            parameters: ParameterKeys::default(),
            export: ExportConfig::default(),
            compute: ComputeConfig::default(),
            notify: NotifyConfig::default(),
            logging: LoggingConfig::default(),
            local: LocalConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Renders the configuration as YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Writes the configuration to a YAML file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let yaml = self.to_yaml_string()?;
        std::fs::write(path, yaml).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks ranges and cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("deadline_seconds", self.deadline_seconds)?;
        non_negative("cancel_grace_seconds", self.cancel_grace_seconds)?;
        positive("notify_timeout_seconds", self.notify_timeout_seconds)?;
        positive("export.timeout_seconds", self.export.timeout_seconds)?;
        positive("export.poll_initial_seconds", self.export.poll_initial_seconds)?;
        positive("export.poll_max_seconds", self.export.poll_max_seconds)?;
        positive("compute.timeout_seconds", self.compute.timeout_seconds)?;
        positive("compute.poll_interval_seconds", self.compute.poll_interval_seconds)?;

        let multiplier = self.export.poll_multiplier;
        if !(1.0..=MAX_POLL_MULTIPLIER).contains(&multiplier) {
            return Err(ConfigError::Invalid(format!(
                "export.poll_multiplier must be within [1.0, {MAX_POLL_MULTIPLIER}], got {multiplier}"
            )));
        }
        if self.export.timeout_seconds > self.deadline_seconds {
            return Err(ConfigError::Invalid(
                "export.timeout_seconds must not exceed deadline_seconds".to_string(),
            ));
        }
        if self.compute.timeout_seconds > self.deadline_seconds {
            return Err(ConfigError::Invalid(
                "compute.timeout_seconds must not exceed deadline_seconds".to_string(),
            ));
        }
        if self.namespaces.scored.trim_matches('/').is_empty()
            && self.namespaces.scored_location.is_none()
        {
            return Err(ConfigError::Invalid(
                "namespaces.scored must not be empty".to_string(),
            ));
        }
        if self.namespaces.raw.trim_matches('/').is_empty() {
            return Err(ConfigError::Invalid(
                "namespaces.raw must not be empty".to_string(),
            ));
        }
        let retries = [
            ("notify.retry", Some(&self.notify.retry)),
            ("export.retry", self.export.retry.as_ref()),
            ("compute.retry", self.compute.retry.as_ref()),
        ];
        for (name, retry) in retries {
            if retry.is_some_and(|r| r.max_attempts == 0) {
                return Err(ConfigError::Invalid(format!(
                    "{name}.max_attempts must be at least 1"
                )));
            }
        }
        if self.export.data_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "export.data_extensions must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Gets the overall deadline as a Duration.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs_f64(self.deadline_seconds)
    }

    /// Gets the cancellation grace period as a Duration.
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs_f64(self.cancel_grace_seconds)
    }

    /// Gets the notification time box as a Duration.
    #[must_use]
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.notify_timeout_seconds)
    }
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= MAX_DURATION_SECONDS {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{name} must be within (0, {MAX_DURATION_SECONDS}], got {value}"
        )))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=MAX_DURATION_SECONDS).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{name} must be within [0, {MAX_DURATION_SECONDS}], got {value}"
        )))
    }
}

/// Storage namespaces under the data bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Key namespace for exported snapshots.
    #[serde(default = "default_raw_namespace")]
    pub raw: String,

    /// Key namespace for scored output.
    #[serde(default = "default_scored_namespace")]
    pub scored: String,

    /// Full scored namespace; when set, the data bucket is not consulted.
    #[serde(default)]
    pub scored_location: Option<String>,
}

fn default_raw_namespace() -> String {
    "trust_scoring/raw".to_string()
}

fn default_scored_namespace() -> String {
    "trust_scoring/scored".to_string()
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            raw: default_raw_namespace(),
            scored: default_scored_namespace(),
            scored_location: None,
        }
    }
}

/// Names of the keys looked up in the parameter store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterKeys {
    /// Extraction query text.
    #[serde(default = "default_sql_key")]
    pub sql: String,
    /// Bucket holding raw and scored data.
    #[serde(default = "default_bucket_key")]
    pub data_bucket: String,
    /// Warehouse workgroup.
    #[serde(default = "default_workgroup_key")]
    pub workgroup: String,
    /// Warehouse database.
    #[serde(default = "default_database_key")]
    pub database: String,
    /// Role the warehouse assumes to write the snapshot.
    #[serde(default = "default_unload_role_key")]
    pub unload_role: String,
    /// Notification topic.
    #[serde(default = "default_topic_key")]
    pub notify_topic: String,
    /// Keys that must resolve before the export stage starts.
    ///
    /// Defaults to every key above.
    #[serde(default)]
    pub required: Option<Vec<String>>,
}

fn default_sql_key() -> String {
    "/trust_scoring/sql".to_string()
}

fn default_bucket_key() -> String {
    "/trust_scoring/data_bucket".to_string()
}

fn default_workgroup_key() -> String {
    "/trust_scoring/redshift/workgroup".to_string()
}

fn default_database_key() -> String {
    "/trust_scoring/redshift/database".to_string()
}

fn default_unload_role_key() -> String {
    "/trust_scoring/redshift/unload_role_arn".to_string()
}

fn default_topic_key() -> String {
    "/trust_scoring/notify_topic_arn".to_string()
}

impl Default for ParameterKeys {
    fn default() -> Self {
        Self {
            sql: default_sql_key(),
            data_bucket: default_bucket_key(),
            workgroup: default_workgroup_key(),
            database: default_database_key(),
            unload_role: default_unload_role_key(),
            notify_topic: default_topic_key(),
            required: None,
        }
    }
}

impl ParameterKeys {
    /// Returns the keys checked before the export stage starts.
    #[must_use]
    pub fn required_keys(&self) -> Vec<String> {
        self.required.clone().unwrap_or_else(|| {
            vec![
                self.sql.clone(),
                self.data_bucket.clone(),
                self.workgroup.clone(),
                self.database.clone(),
                self.unload_role.clone(),
                self.notify_topic.clone(),
            ]
        })
    }
}

/// What the export stage does when the snapshot is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyResultPolicy {
    /// Fail with `ExportEmptyResult`.
    #[default]
    Fail,
    /// Continue with an empty snapshot.
    Allow,
}

/// Export stage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Stage timeout.
    #[serde(default = "default_export_timeout")]
    pub timeout_seconds: f64,
    /// First status poll delay.
    #[serde(default = "default_poll_initial")]
    pub poll_initial_seconds: f64,
    /// Growth factor between polls.
    #[serde(default = "default_poll_multiplier")]
    pub poll_multiplier: f64,
    /// Poll delay cap.
    #[serde(default = "default_poll_max")]
    pub poll_max_seconds: f64,
    /// Empty snapshot policy.
    #[serde(default)]
    pub empty_result: EmptyResultPolicy,
    /// Suffixes that mark snapshot data objects.
    #[serde(default = "default_data_extensions")]
    pub data_extensions: Vec<String>,
    /// Retries transient export failures when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

const fn default_export_timeout() -> f64 {
    5.0 * 60.0
}

const fn default_poll_initial() -> f64 {
    1.0
}

const fn default_poll_multiplier() -> f64 {
    1.5
}

const fn default_poll_max() -> f64 {
    10.0
}

fn default_data_extensions() -> Vec<String> {
    vec![".parquet".to_string(), ".pq".to_string(), ".csv".to_string()]
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_export_timeout(),
            poll_initial_seconds: default_poll_initial(),
            poll_multiplier: default_poll_multiplier(),
            poll_max_seconds: default_poll_max(),
            empty_result: EmptyResultPolicy::default(),
            data_extensions: default_data_extensions(),
            retry: None,
        }
    }
}

impl ExportConfig {
    /// Gets the stage timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }

    /// Returns the poll delay that follows `current`.
    #[must_use]
    pub fn next_poll_delay(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.poll_multiplier)
            .min(Duration::from_secs_f64(self.poll_max_seconds))
    }
}

/// Compute stage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Container image reference.
    #[serde(default = "default_image")]
    pub image: String,
    /// Command override.
    #[serde(default)]
    pub command: Vec<String>,
    /// Stage timeout; kept below the overall deadline.
    #[serde(default = "default_compute_timeout")]
    pub timeout_seconds: f64,
    /// Delay between job status polls.
    #[serde(default = "default_compute_poll")]
    pub poll_interval_seconds: f64,
    /// Column holding the text to score.
    #[serde(default = "default_text_column")]
    pub text_column: String,
    /// Where the job downloads its models from.
    #[serde(default)]
    pub models_prefix: Option<String>,
    /// Extra static environment for the job.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Retries scheduling failures when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

fn default_image() -> String {
    "scoreflow/scorer:latest".to_string()
}

const fn default_compute_timeout() -> f64 {
    110.0 * 60.0
}

const fn default_compute_poll() -> f64 {
    15.0
}

fn default_text_column() -> String {
    "cleaned_comment".to_string()
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            command: Vec::new(),
            timeout_seconds: default_compute_timeout(),
            poll_interval_seconds: default_compute_poll(),
            text_column: default_text_column(),
            models_prefix: None,
            environment: BTreeMap::new(),
            retry: None,
        }
    }
}

impl ComputeConfig {
    /// Gets the stage timeout as a Duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }

    /// Gets the poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }
}

/// Notify stage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Delivery attempts and backoff.
    #[serde(default = "default_notify_retry")]
    pub retry: RetryConfig,
    /// Prefix of the subject line.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn default_notify_retry() -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(3)
        .with_base_delay_ms(200)
        .with_max_delay_ms(2_000)
}

fn default_subject_prefix() -> String {
    "Scoring".to_string()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            retry: default_notify_retry(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Settings for the local, process-backed collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory that `scheme://bucket/key` locations map onto.
    #[serde(default = "default_local_root")]
    pub root: PathBuf,
    /// Command that performs the extraction.
    #[serde(default)]
    pub export_command: Vec<String>,
    /// Static parameters, overridable by `SCOREFLOW_PARAM_*` variables.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn default_local_root() -> PathBuf {
    PathBuf::from(".scoreflow")
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: default_local_root(),
            export_command: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }
}
