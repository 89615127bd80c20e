//! One audit pass over the configured buckets.
//!
//! For each bucket/prefix the auditor lists objects modified within the audit
//! window, resolves the uploader of each, and collects one [`AuditRow`] per
//! object. Rows are reported as a CSV object in the output bucket and as
//! notifications. A failing bucket is reported and skipped; the report is
//! written regardless.

use crate::config::{BucketTarget, Config};
use crate::lister::list_recent_objects;
use crate::matcher::UNKNOWN_IDENTITY;
use crate::notifier::Notifier;
use crate::report::{self, AuditRow};
use crate::resolver::{
    LogCache, ResolutionOutcome, ResolverConfig, TargetObject, UploaderResolver,
};
use crate::store::{ObjectStore, StoreError};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Uploader reported while the write event has not reached the logs
pub const LOGS_NOT_UPLOADED: &str = "Logs not uploaded yet";

/// Subject of bucket-level alerts
pub const ALERT_SUBJECT: &str = "S3 File Notification Alert";

/// Subject of per-file and summary notifications
pub const METADATA_SUBJECT: &str = "S3 File Metadata Notification";

const CSV_CONTENT_TYPE: &str = "text/csv";

/// Run-level settings
#[derive(Debug, Clone)]
pub struct AuditSettings {
    /// Buckets to audit, in order
    pub targets: Vec<BucketTarget>,
    /// Objects modified within this window before `now` are audited
    pub window: Duration,
    /// Objects resolved at the same time
    pub resolve_concurrency: usize,
    pub output_bucket: String,
    pub output_prefix: String,
    /// Publish one notification per audited object
    pub notify_per_file: bool,
}

impl AuditSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            targets: config.audit.targets.clone(),
            window: config.audit_window(),
            resolve_concurrency: config.audit.resolve_concurrency.max(1),
            output_bucket: config.report.output_bucket.clone(),
            output_prefix: config.report.output_prefix.clone(),
            notify_per_file: config.report.notify_per_file,
        }
    }
}

/// How a single bucket's audit ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    /// At least one recent object was audited
    Audited,
    /// No object was modified within the window
    NoRecentFiles,
    /// The bucket listing failed
    Failed,
}

/// Outcome of one audit pass
#[derive(Debug)]
pub struct AuditSummary {
    pub run_id: Uuid,
    pub ran_at: DateTime<Utc>,
    /// Rows in bucket order, then listing order
    pub rows: Vec<AuditRow>,
    /// Status per configured bucket, in order
    pub buckets: Vec<(BucketTarget, BucketStatus)>,
    /// Key the CSV report was written to (or attempted)
    pub report_key: String,
    /// Set when the CSV report could not be written
    pub report_error: Option<String>,
}

impl AuditSummary {
    pub fn resolved_count(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| r.error.is_none() && r.uploader != LOGS_NOT_UPLOADED)
            .count()
    }

    pub fn failed_buckets(&self) -> usize {
        self.buckets
            .iter()
            .filter(|(_, status)| *status == BucketStatus::Failed)
            .count()
    }
}

/// Runs audit passes. Holds no state between runs.
pub struct Auditor {
    store: Arc<dyn ObjectStore>,
    notifier: Arc<dyn Notifier>,
    resolver: UploaderResolver,
    settings: AuditSettings,
}

impl Auditor {
    /// Build an auditor from the loaded configuration
    pub fn new(store: Arc<dyn ObjectStore>, notifier: Arc<dyn Notifier>, config: &Config) -> Self {
        Self::with_settings(
            store,
            notifier,
            ResolverConfig::from_config(config),
            AuditSettings::from_config(config),
        )
    }

    pub fn with_settings(
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn Notifier>,
        resolver_config: ResolverConfig,
        settings: AuditSettings,
    ) -> Self {
        let resolver = UploaderResolver::new(store.clone(), resolver_config);
        Self {
            store,
            notifier,
            resolver,
            settings,
        }
    }

    /// Run one audit pass anchored at `now`
    #[instrument(skip(self, now), fields(run_id))]
    pub async fn run(&self, now: DateTime<Utc>) -> AuditSummary {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        info!(
            buckets = self.settings.targets.len(),
            window_minutes = self.settings.window.num_minutes(),
            "Starting audit pass"
        );

        let mut rows = Vec::new();
        let mut buckets = Vec::with_capacity(self.settings.targets.len());
        let cache = LogCache::new();

        for target in &self.settings.targets {
            let status = self.audit_bucket(target, now, &cache, &mut rows).await;
            buckets.push((target.clone(), status));
        }

        if !rows.is_empty() {
            self.notify(METADATA_SUBJECT, &report::render_summary(&rows))
                .await;
        }

        let report_key = report::report_key(&self.settings.output_prefix, now);
        let report_error = self.write_report(&report_key, &rows).await.err();
        if report_error.is_some() {
            metrics::counter!("auditor.reports.failed").increment(1);
        }
        metrics::counter!("auditor.rows").increment(rows.len() as u64);

        let summary = AuditSummary {
            run_id,
            ran_at: now,
            rows,
            buckets,
            report_key,
            report_error,
        };

        info!(
            rows = summary.rows.len(),
            resolved = summary.resolved_count(),
            failed_buckets = summary.failed_buckets(),
            report_key = %summary.report_key,
            "Audit pass complete"
        );

        summary
    }

    #[instrument(skip(self, target, now, cache, rows), fields(bucket = %target.bucket, prefix = %target.prefix))]
    async fn audit_bucket(
        &self,
        target: &BucketTarget,
        now: DateTime<Utc>,
        cache: &LogCache,
        rows: &mut Vec<AuditRow>,
    ) -> BucketStatus {
        let objects = match self.recent_objects(target, now).await {
            Ok(objects) => objects,
            Err(e) => {
                error!(error = %e, "Bucket listing failed");
                metrics::counter!("auditor.buckets.failed").increment(1);
                rows.push(AuditRow {
                    bucket: target.bucket.clone(),
                    prefix: target.prefix.clone(),
                    filename: String::new(),
                    uploader: UNKNOWN_IDENTITY.to_string(),
                    size_bytes: None,
                    landed_at: None,
                    ran_at: now,
                    error: Some(e.to_string()),
                });
                self.notify(
                    ALERT_SUBJECT,
                    &format!(
                        "An error occurred while processing bucket: {}/{}\n\nError: {}",
                        target.bucket, target.prefix, e
                    ),
                )
                .await;
                return BucketStatus::Failed;
            }
        };

        if objects.is_empty() {
            info!("No recent files in bucket");
            metrics::counter!("auditor.buckets.empty").increment(1);
            self.notify(
                ALERT_SUBJECT,
                &format!(
                    "No recent files have been uploaded to bucket: {}/{}.",
                    target.bucket, target.prefix
                ),
            )
            .await;
            return BucketStatus::NoRecentFiles;
        }

        info!(objects = objects.len(), "Resolving uploaders");

        let resolver = &self.resolver;
        let resolved: Vec<(TargetObject, ResolutionOutcome)> = futures::stream::iter(objects)
            .map(|object| async move {
                let outcome = resolver.resolve_cached(&object, now, cache).await;
                (object, outcome)
            })
            .buffered(self.settings.resolve_concurrency)
            .collect()
            .await;

        for (object, outcome) in resolved {
            let row = build_row(&object, outcome, now);

            if self.settings.notify_per_file {
                self.notify(METADATA_SUBJECT, &row.to_json().to_string())
                    .await;
            }

            rows.push(row);
        }

        BucketStatus::Audited
    }

    /// Objects under the target modified within the audit window, in listing
    /// order
    async fn recent_objects(
        &self,
        target: &BucketTarget,
        now: DateTime<Utc>,
    ) -> Result<Vec<TargetObject>, StoreError> {
        let cutoff = now - self.settings.window;

        list_recent_objects(
            self.store.as_ref(),
            &target.bucket,
            &target.prefix,
            Some(cutoff),
        )
        .try_filter_map(|obj| async move {
            // The lister only yields objects with a modification time here.
            Ok::<_, StoreError>(obj.last_modified.map(|landed_at| TargetObject {
                bucket: target.bucket.clone(),
                key: obj.key,
                landed_at,
                size_bytes: Some(obj.size),
            }))
        })
        .try_collect()
        .await
    }

    async fn write_report(&self, key: &str, rows: &[AuditRow]) -> Result<(), String> {
        let csv = report::render_csv(rows).map_err(|e| {
            error!(error = %e, "Failed to render report");
            e.to_string()
        })?;

        self.store
            .put_object(
                &self.settings.output_bucket,
                key,
                Bytes::from(csv),
                CSV_CONTENT_TYPE,
            )
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to write report");
                e.to_string()
            })?;

        info!(
            bucket = %self.settings.output_bucket,
            key = %key,
            rows = rows.len(),
            "Report written"
        );
        Ok(())
    }

    async fn notify(&self, subject: &str, body: &str) {
        if let Err(e) = self.notifier.publish(subject, body).await {
            warn!(error = %e, subject = %subject, "Notification failed");
        }
    }
}

fn build_row(object: &TargetObject, outcome: ResolutionOutcome, ran_at: DateTime<Utc>) -> AuditRow {
    let (prefix, filename) = report::split_key(&object.key);

    let (uploader, error) = match outcome {
        ResolutionOutcome::Found { uploader, .. } => (uploader.user_name, None),
        ResolutionOutcome::NotFound => (LOGS_NOT_UPLOADED.to_string(), None),
        ResolutionOutcome::Error(e) => (UNKNOWN_IDENTITY.to_string(), Some(e.to_string())),
    };

    AuditRow {
        bucket: object.bucket.clone(),
        prefix: prefix.to_string(),
        filename: filename.to_string(),
        uploader,
        size_bytes: object.size_bytes,
        landed_at: Some(object.landed_at),
        ran_at,
        error,
    }
}
