//! Configuration for the upload auditor.
//!
//! Settings are read from an optional config file and from plain environment
//! variables (`BUCKET_NAMES`, `LOG_BUCKET`, `OUTPUT_BUCKET`, ...), then
//! validated into typed sections. Any problem here is fatal at startup.

use crate::decoder::LogFormat;
use crate::matcher::IdentitySource;
use crate::partition::LogPathTemplate;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::LoadError(e.to_string())
    }
}

/// Main configuration for the upload auditor
#[derive(Debug, Clone)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Buckets and audit window
    pub audit: AuditConfig,
    /// Where and how to search the audit-trail logs
    pub logs: LogSearchConfig,
    /// CSV report and notification settings
    pub report: ReportConfig,
    /// AWS client settings
    pub aws: AwsConfig,
}

/// Service-level configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Port for the Prometheus scrape endpoint; metrics are only rendered
    /// to the log at exit when unset
    pub metrics_port: Option<u16>,
}

/// A monitored bucket and the key prefix to audit within it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTarget {
    pub bucket: String,
    pub prefix: String,
}

/// Audit window configuration
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Buckets to audit, in the order they are processed
    pub targets: Vec<BucketTarget>,
    /// Objects modified within this many minutes are audited
    pub window_minutes: u64,
    /// Number of objects resolved concurrently
    pub resolve_concurrency: usize,
}

/// Audit-trail log search configuration
#[derive(Debug, Clone)]
pub struct LogSearchConfig {
    /// Bucket holding the audit-trail logs
    pub bucket: String,
    /// Partition prefix template
    pub path_template: LogPathTemplate,
    /// Log objects older than this many minutes are not scanned
    pub recency_minutes: u64,
    /// Day offsets searched around the landing date, in order
    pub day_offsets: Vec<i64>,
    /// Hour offsets searched within each day offset (hourly templates only)
    pub hour_offsets: Vec<i64>,
    /// Layout of the log objects
    pub format: LogFormat,
    /// Which identity field is reported as the uploader
    pub identity_source: IdentitySource,
}

/// Report sink and notification configuration
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Bucket receiving the CSV report
    pub output_bucket: String,
    /// Key prefix for the CSV report
    pub output_prefix: String,
    /// SNS topic for notifications; notifications are only logged when unset
    pub sns_topic_arn: Option<String>,
    /// Publish one metadata notification per audited file
    pub notify_per_file: bool,
}

/// AWS client configuration
#[derive(Debug, Clone)]
pub struct AwsConfig {
    /// AWS region
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
}

/// Values supplied on the command line, applied on top of the environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Replaces `BUCKET_NAMES` with a single `bucket:prefix` pair
    pub bucket_names: Option<String>,
    /// Replaces `LOG_BUCKET`
    pub log_bucket: Option<String>,
    /// Replaces `MAX_TIME_INTERVAL` (minutes)
    pub window_minutes: Option<u64>,
}

/// Flat settings exactly as they appear in the environment
#[derive(Debug, Clone, Deserialize)]
struct RawSettings {
    bucket_names: Option<String>,
    log_bucket: Option<String>,
    output_bucket: Option<String>,
    sns_topic_arn: Option<String>,
    #[serde(default = "default_max_time_interval")]
    max_time_interval: u64,
    #[serde(default = "default_log_recency_minutes")]
    log_recency_minutes: u64,
    #[serde(default = "default_log_path_template")]
    log_path_template: String,
    #[serde(default = "default_day_offsets")]
    day_offsets: String,
    #[serde(default = "default_hour_offsets")]
    hour_offsets: String,
    #[serde(default = "default_log_format")]
    log_format: String,
    #[serde(default = "default_identity_source")]
    identity_source: String,
    #[serde(default = "default_output_prefix")]
    output_prefix: String,
    #[serde(default)]
    notify_per_file: bool,
    #[serde(default = "default_resolve_concurrency")]
    resolve_concurrency: usize,
    #[serde(default = "default_region")]
    aws_region: String,
    s3_endpoint_url: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    metrics_port: Option<u16>,
}

// Default value functions
fn default_max_time_interval() -> u64 {
    180 // minutes
}

fn default_log_recency_minutes() -> u64 {
    180
}

/// Placeholder layout; real CloudTrail deliveries sit under
/// `AWSLogs/<account>/CloudTrail/<region>/%Y/%m/%d/`
pub const DEFAULT_LOG_PATH_TEMPLATE: &str = "AWSLogs/%Y/%m/%d/";

fn default_log_path_template() -> String {
    DEFAULT_LOG_PATH_TEMPLATE.to_string()
}

fn default_day_offsets() -> String {
    "0,-1,1".to_string()
}

fn default_hour_offsets() -> String {
    "0,-1,1".to_string()
}

fn default_log_format() -> String {
    "cloudtrail".to_string()
}

fn default_identity_source() -> String {
    "user_name".to_string()
}

fn default_output_prefix() -> String {
    "csv/uploads/".to_string()
}

fn default_resolve_concurrency() -> usize {
    4
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from config files and the process environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(&ConfigOverrides::default())
    }

    /// Load configuration, letting command-line values win over the environment
    pub fn load_with(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::build(config::Environment::default(), overrides)
    }

    /// Load configuration from an explicit variable map instead of the process
    /// environment
    pub fn from_vars<I, K, V>(vars: I, overrides: &ConfigOverrides) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let source: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self::build(config::Environment::default().source(Some(source)), overrides)
    }

    fn build(
        environment: config::Environment,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/auditor").required(false))
            .add_source(config::File::with_name("/etc/upload-auditor/auditor").required(false))
            // BUCKET_NAMES -> bucket_names, LOG_BUCKET -> log_bucket, ...
            .add_source(environment.try_parsing(true))
            .set_override_option("bucket_names", overrides.bucket_names.clone())?
            .set_override_option("log_bucket", overrides.log_bucket.clone())?
            .set_override_option("max_time_interval", overrides.window_minutes)?
            .build()?;

        let raw: RawSettings = settings.try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let targets = parse_bucket_names(&required(raw.bucket_names, "BUCKET_NAMES")?)?;
        let log_bucket = required(raw.log_bucket, "LOG_BUCKET")?;
        let output_bucket = required(raw.output_bucket, "OUTPUT_BUCKET")?;

        if raw.max_time_interval == 0 {
            return Err(invalid("MAX_TIME_INTERVAL", "audit window must be at least one minute"));
        }
        if raw.resolve_concurrency == 0 {
            return Err(invalid("RESOLVE_CONCURRENCY", "must be at least 1"));
        }

        let path_template = LogPathTemplate::parse(&raw.log_path_template)
            .map_err(|e| invalid("LOG_PATH_TEMPLATE", e.to_string()))?;
        let day_offsets = parse_day_offsets(&raw.day_offsets)?;
        let hour_offsets = parse_hour_offsets(&raw.hour_offsets)?;
        let format = raw
            .log_format
            .parse::<LogFormat>()
            .map_err(|e| invalid("LOG_FORMAT", e))?;
        let identity_source = raw
            .identity_source
            .parse::<IdentitySource>()
            .map_err(|e| invalid("IDENTITY_SOURCE", e))?;

        Ok(Self {
            service: ServiceConfig {
                log_level: raw.log_level,
                metrics_port: raw.metrics_port,
            },
            audit: AuditConfig {
                targets,
                window_minutes: raw.max_time_interval,
                resolve_concurrency: raw.resolve_concurrency,
            },
            logs: LogSearchConfig {
                bucket: log_bucket,
                path_template,
                recency_minutes: raw.log_recency_minutes,
                day_offsets,
                hour_offsets,
                format,
                identity_source,
            },
            report: ReportConfig {
                output_bucket,
                output_prefix: raw.output_prefix,
                sns_topic_arn: raw.sns_topic_arn.filter(|arn| !arn.trim().is_empty()),
                notify_per_file: raw.notify_per_file,
            },
            aws: AwsConfig {
                region: raw.aws_region,
                endpoint_url: raw.s3_endpoint_url.filter(|url| !url.trim().is_empty()),
            },
        })
    }

    /// Get the audit window as a chrono duration
    pub fn audit_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.audit.window_minutes as i64)
    }

    /// Whether the log path template was left at its placeholder default
    pub fn uses_default_log_template(&self) -> bool {
        self.logs.path_template.as_str() == DEFAULT_LOG_PATH_TEMPLATE
    }

    /// Get the log recency threshold as a chrono duration
    pub fn log_recency(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.logs.recency_minutes as i64)
    }
}

impl AwsConfig {
    /// Build the shared SDK configuration used by the S3 and SNS clients
    pub async fn load_sdk_config(&self) -> SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()));

        if let Some(ref endpoint_url) = self.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        loader.load().await
    }
}

fn required(value: Option<String>, key: &str) -> Result<String, ConfigError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingRequired(key.to_string()))
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Parse `bucket01:prefix01,bucket02:prefix02`. A bare bucket name audits the
/// whole bucket.
pub fn parse_bucket_names(value: &str) -> Result<Vec<BucketTarget>, ConfigError> {
    let mut targets = Vec::new();

    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (bucket, prefix) = match entry.split_once(':') {
            Some((bucket, prefix)) => (bucket.trim(), prefix.trim()),
            None => (entry, ""),
        };

        if bucket.is_empty() {
            return Err(invalid(
                "BUCKET_NAMES",
                format!("entry '{}' has an empty bucket name", entry),
            ));
        }

        targets.push(BucketTarget {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        });
    }

    if targets.is_empty() {
        return Err(ConfigError::MissingRequired("BUCKET_NAMES".to_string()));
    }

    Ok(targets)
}

/// Parse a comma-separated list of signed day offsets, keeping their order.
pub fn parse_day_offsets(value: &str) -> Result<Vec<i64>, ConfigError> {
    parse_offsets("DAY_OFFSETS", value, 7)
}

/// Parse a comma-separated list of signed hour offsets, keeping their order.
pub fn parse_hour_offsets(value: &str) -> Result<Vec<i64>, ConfigError> {
    parse_offsets("HOUR_OFFSETS", value, 23)
}

fn parse_offsets(key: &str, value: &str, limit: i64) -> Result<Vec<i64>, ConfigError> {
    let offsets = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| invalid(key, format!("'{}' is not an integer", s)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if offsets.is_empty() {
        return Err(invalid(key, "at least one offset is required"));
    }
    if let Some(bad) = offsets.iter().find(|o| o.abs() > limit) {
        return Err(invalid(
            key,
            format!("offset {} is outside the supported range -{}..={}", bad, limit, limit),
        ));
    }

    Ok(offsets)
}
