use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upload_auditor::{
    Auditor, Config, ConfigOverrides, LogNotifier, Notifier, S3ObjectStore, SnsNotifier,
};

/// Run one upload audit pass.
///
/// Settings come from the environment (`BUCKET_NAMES`, `LOG_BUCKET`,
/// `OUTPUT_BUCKET`, ...). The flags below override them for local runs:
///
///   upload-auditor --bucket landing --prefix csv/in/ --log-bucket trail-logs --window 60
#[derive(Parser, Debug)]
#[command(name = "upload-auditor")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Audit only this bucket (replaces BUCKET_NAMES)
    #[arg(short, long)]
    bucket: Option<String>,

    /// Key prefix within --bucket
    #[arg(short, long, requires = "bucket")]
    prefix: Option<String>,

    /// Bucket holding the CloudTrail logs (replaces LOG_BUCKET)
    #[arg(long)]
    log_bucket: Option<String>,

    /// Audit window in minutes (replaces MAX_TIME_INTERVAL)
    #[arg(short, long)]
    window: Option<u64>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bucket_names: self.bucket.as_ref().map(|bucket| {
                format!("{}:{}", bucket, self.prefix.as_deref().unwrap_or_default())
            }),
            log_bucket: self.log_bucket.clone(),
            window_minutes: self.window,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load_with(&cli.overrides()).context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    // Initialize metrics
    let metrics = init_metrics(config.service.metrics_port)?;

    if config.uses_default_log_template() {
        warn!(
            template = config.logs.path_template.as_str(),
            "LOG_PATH_TEMPLATE not set; the default omits the AWSLogs/<account>/CloudTrail/<region>/ segments of a real trail and will rarely match"
        );
    }

    info!(
        buckets = config.audit.targets.len(),
        log_bucket = %config.logs.bucket,
        window_minutes = config.audit.window_minutes,
        "Starting upload auditor"
    );

    let store = Arc::new(S3ObjectStore::new(&config.aws).await);

    let notifier: Arc<dyn Notifier> = match config.report.sns_topic_arn {
        Some(ref topic_arn) => Arc::new(SnsNotifier::new(&config.aws, topic_arn.clone()).await),
        None => {
            info!("SNS_TOPIC_ARN not set, notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let auditor = Auditor::new(store, notifier, &config);
    let summary = auditor.run(Utc::now()).await;

    info!(
        run_id = %summary.run_id,
        rows = summary.rows.len(),
        resolved = summary.resolved_count(),
        failed_buckets = summary.failed_buckets(),
        "Upload auditor finished"
    );

    if let Some(handle) = metrics {
        info!(metrics = %handle.render(), "Run metrics");
    }

    if let Some(ref e) = summary.report_error {
        error!(error = %e, key = %summary.report_key, "Report was not written");
        bail!("Failed to write report {}: {}", summary.report_key, e);
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Install the Prometheus recorder. With a port the metrics are served over
/// HTTP for the lifetime of the run; without one the handle is returned so
/// the final snapshot can be logged.
fn init_metrics(port: Option<u16>) -> Result<Option<PrometheusHandle>> {
    let builder = PrometheusBuilder::new();

    match port {
        Some(port) => {
            builder
                .with_http_listener(([0, 0, 0, 0], port))
                .install()
                .context("Failed to install Prometheus metrics exporter")?;

            info!(port = port, "Prometheus metrics exporter started");
            Ok(None)
        }
        None => {
            let handle = builder
                .install_recorder()
                .context("Failed to install Prometheus metrics recorder")?;
            Ok(Some(handle))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_become_overrides() {
        let cli = Cli::parse_from([
            "upload-auditor",
            "--bucket",
            "landing",
            "--prefix",
            "csv/in/",
            "--log-bucket",
            "trail-logs",
            "--window",
            "60",
        ]);

        let overrides = cli.overrides();

        assert_eq!(overrides.bucket_names.as_deref(), Some("landing:csv/in/"));
        assert_eq!(overrides.log_bucket.as_deref(), Some("trail-logs"));
        assert_eq!(overrides.window_minutes, Some(60));
    }

    #[test]
    fn test_no_flags_no_overrides() {
        let overrides = Cli::parse_from(["upload-auditor"]).overrides();

        assert!(overrides.bucket_names.is_none());
        assert!(overrides.log_bucket.is_none());
        assert!(overrides.window_minutes.is_none());
    }

    #[test]
    fn test_prefix_requires_bucket() {
        assert!(Cli::try_parse_from(["upload-auditor", "--prefix", "csv/"]).is_err());
    }
}
