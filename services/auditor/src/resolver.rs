//! Uploader resolution.
//!
//! For one target object the resolver walks the candidate log partitions in
//! order, lists the recent log objects in each, decodes them and returns the
//! first `PutObject` event for the target. The search for a single target is
//! strictly sequential so the first match is reproducible; separate targets
//! may be resolved concurrently and share a [`LogCache`].

use crate::config::Config;
use crate::decoder::{decode, DecodedLog, LogFormat};
use crate::lister::list_recent_objects;
use crate::matcher::{EventMatcher, IdentitySource, Uploader};
use crate::partition::{enumerate_partitions, LogPathTemplate};
use crate::store::{ObjectStore, ObjectSummary, StoreError};
use chrono::{DateTime, Duration, Utc};
use futures::{pin_mut, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Failures that abort the resolution of one target
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Listing audit logs failed: {0}")]
    ListLogs(#[source] StoreError),

    #[error("Reading audit log failed: {0}")]
    ReadLog(#[source] StoreError),
}

/// Resolver settings
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Bucket holding the audit-trail logs
    pub log_bucket: String,
    /// Partition prefix template
    pub path_template: LogPathTemplate,
    /// Log objects last modified longer ago than this are skipped; `None`
    /// scans every object in a partition
    pub recency: Option<Duration>,
    /// Day offsets searched around the landing date, in order
    pub day_offsets: Vec<i64>,
    /// Hour offsets searched within each day, used with hourly templates
    pub hour_offsets: Vec<i64>,
    /// Layout of the log objects
    pub format: LogFormat,
    /// Which identity field is reported
    pub identity_source: IdentitySource,
}

impl ResolverConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            log_bucket: config.logs.bucket.clone(),
            path_template: config.logs.path_template.clone(),
            recency: (config.logs.recency_minutes > 0).then(|| config.log_recency()),
            day_offsets: config.logs.day_offsets.clone(),
            hour_offsets: config.logs.hour_offsets.clone(),
            format: config.logs.format,
            identity_source: config.logs.identity_source,
        }
    }
}

/// An object whose uploader is to be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetObject {
    pub bucket: String,
    pub key: String,
    /// Last-modified time reported by the object store
    pub landed_at: DateTime<Utc>,
    pub size_bytes: Option<u64>,
}

/// Result of resolving one target
#[derive(Debug)]
pub enum ResolutionOutcome {
    /// A matching write event was found
    Found {
        uploader: Uploader,
        /// Log object that held the event
        log_key: String,
    },
    /// No searched partition held a matching event yet
    NotFound,
    /// The search could not be completed
    Error(ResolveError),
}

impl ResolutionOutcome {
    pub fn is_found(&self) -> bool {
        matches!(self, ResolutionOutcome::Found { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            ResolutionOutcome::Found { .. } => "found",
            ResolutionOutcome::NotFound => "not_found",
            ResolutionOutcome::Error(_) => "error",
        }
    }
}

/// Log listings and decoded log objects shared by the resolutions of one run.
///
/// A listing is stored only once it has been drained completely, so a search
/// that stops at its first match leaves the partition to be listed again.
/// Undecodable objects are remembered as `None`. Store failures are never
/// cached. Two resolutions racing on the same key may both fetch it.
///
/// Build a fresh cache per run: listings are filtered against that run's `now`.
#[derive(Debug, Default)]
pub struct LogCache {
    listings: Mutex<HashMap<String, Arc<Vec<ObjectSummary>>>>,
    logs: Mutex<HashMap<String, Option<Arc<DecodedLog>>>>,
}

impl LogCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn listing(&self, prefix: &str) -> Option<Arc<Vec<ObjectSummary>>> {
        self.listings.lock().ok()?.get(prefix).cloned()
    }

    fn store_listing(&self, prefix: &str, objects: Vec<ObjectSummary>) {
        if let Ok(mut listings) = self.listings.lock() {
            listings.insert(prefix.to_string(), Arc::new(objects));
        }
    }

    fn log(&self, key: &str) -> Option<Option<Arc<DecodedLog>>> {
        self.logs.lock().ok()?.get(key).cloned()
    }

    fn store_log(&self, key: &str, decoded: Option<Arc<DecodedLog>>) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.insert(key.to_string(), decoded);
        }
    }

    /// Number of log objects held, decodable or not
    pub fn cached_logs(&self) -> usize {
        self.logs.lock().map(|logs| logs.len()).unwrap_or(0)
    }
}

/// Finds the identity that wrote an object by searching the audit-trail logs
pub struct UploaderResolver {
    store: Arc<dyn ObjectStore>,
    config: ResolverConfig,
}

impl UploaderResolver {
    pub fn new(store: Arc<dyn ObjectStore>, config: ResolverConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve the uploader of `target` with a cache of its own. `now`
    /// anchors the log recency window.
    pub async fn resolve(&self, target: &TargetObject, now: DateTime<Utc>) -> ResolutionOutcome {
        self.resolve_cached(target, now, &LogCache::new()).await
    }

    /// Resolve the uploader of `target`, reusing listings and log objects
    /// already read during this run.
    #[instrument(skip(self, target, now, cache), fields(bucket = %target.bucket, key = %target.key))]
    pub async fn resolve_cached(
        &self,
        target: &TargetObject,
        now: DateTime<Utc>,
        cache: &LogCache,
    ) -> ResolutionOutcome {
        let started = Instant::now();

        let outcome = match self.search(target, now, cache).await {
            Ok(Some((uploader, log_key))) => {
                info!(
                    uploader = %uploader.user_name,
                    log_key = %log_key,
                    "Uploader resolved"
                );
                ResolutionOutcome::Found { uploader, log_key }
            }
            Ok(None) => {
                info!("No write event found in searched partitions");
                ResolutionOutcome::NotFound
            }
            Err(e) => {
                warn!(error = %e, "Uploader resolution failed");
                ResolutionOutcome::Error(e)
            }
        };

        metrics::histogram!("auditor.resolve.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("auditor.resolutions", "outcome" => outcome.label()).increment(1);

        outcome
    }

    async fn search(
        &self,
        target: &TargetObject,
        now: DateTime<Utc>,
        cache: &LogCache,
    ) -> Result<Option<(Uploader, String)>, ResolveError> {
        let matcher = EventMatcher::new(&target.bucket, &target.key, self.config.identity_source);
        let modified_since = self.config.recency.map(|recency| now - recency);
        let hour_offsets = self
            .config
            .path_template
            .is_hourly()
            .then_some(self.config.hour_offsets.as_slice());
        let partitions =
            enumerate_partitions(target.landed_at, &self.config.day_offsets, hour_offsets);

        for partition in partitions {
            let prefix = self.config.path_template.render(&partition);

            if let Some(listing) = cache.listing(&prefix) {
                debug!(partition = %partition, prefix = %prefix, "Searching cached log partition");
                for log_ref in listing.iter() {
                    if let Some(uploader) = self.scan(&log_ref.key, &matcher, cache).await? {
                        return Ok(Some((uploader, log_ref.key.clone())));
                    }
                }
                continue;
            }

            debug!(partition = %partition, prefix = %prefix, "Searching log partition");

            let logs = list_recent_objects(
                self.store.as_ref(),
                &self.config.log_bucket,
                &prefix,
                modified_since,
            );
            pin_mut!(logs);

            let mut listed = Vec::new();
            while let Some(log_ref) = logs.next().await {
                let log_ref = log_ref.map_err(ResolveError::ListLogs)?;

                if let Some(uploader) = self.scan(&log_ref.key, &matcher, cache).await? {
                    return Ok(Some((uploader, log_ref.key)));
                }
                listed.push(log_ref);
            }
            cache.store_listing(&prefix, listed);
        }

        Ok(None)
    }

    /// Look for the target's write event in one log object
    async fn scan(
        &self,
        log_key: &str,
        matcher: &EventMatcher<'_>,
        cache: &LogCache,
    ) -> Result<Option<Uploader>, ResolveError> {
        let decoded = match cache.log(log_key) {
            Some(decoded) => decoded,
            None => {
                let decoded = self.load(log_key).await?;
                cache.store_log(log_key, decoded.clone());
                decoded
            }
        };

        Ok(decoded.and_then(|log| log.events.iter().find_map(|e| matcher.extract(e))))
    }

    /// Fetch and decode one log object; `None` when it cannot be decoded
    async fn load(&self, log_key: &str) -> Result<Option<Arc<DecodedLog>>, ResolveError> {
        let raw = self
            .store
            .get_object(&self.config.log_bucket, log_key)
            .await
            .map_err(ResolveError::ReadLog)?;
        metrics::counter!("auditor.log_objects.fetched").increment(1);

        let decoded = match decode(&raw, self.config.format) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(log_key = %log_key, error = %e, "Skipping undecodable log object");
                metrics::counter!("auditor.log_objects.skipped").increment(1);
                return Ok(None);
            }
        };

        let skipped = decoded.skipped_lines + decoded.skipped_records;
        if skipped > 0 {
            debug!(
                log_key = %log_key,
                skipped_lines = decoded.skipped_lines,
                skipped_records = decoded.skipped_records,
                "Dropped malformed log entries"
            );
            metrics::counter!("auditor.log_entries.skipped").increment(skipped as u64);
        }

        Ok(Some(Arc::new(decoded)))
    }
}
