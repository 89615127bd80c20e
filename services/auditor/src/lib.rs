//! Upload Auditor
//!
//! Finds out who uploaded recently landed objects in a set of S3 buckets. The
//! auditor lists each bucket for objects modified within the audit window,
//! searches the CloudTrail logs for the `PutObject` event that wrote each one,
//! and reports the result as a CSV object plus SNS notifications.
//!
//! ## Features
//!
//! - **Skew-tolerant search**: log partitions for the landing day and the days
//!   around it are searched in a fixed order
//! - **Robust decoding**: gzip is detected by magic number, malformed lines are
//!   dropped individually
//! - **Exact matching**: bucket and key must be equal, never a substring
//! - **Two log layouts**: CloudTrail JSON and S3 server access logs
//! - **Isolated failures**: a failing object or bucket is reported and the run
//!   carries on
//!
//! ## Architecture
//!
//! ```text
//! Monitored Buckets          CloudTrail Log Bucket         Output
//! ┌──────────────┐           ┌──────────────────┐         ┌──────────────┐
//! │ bucket:prefix│           │ AWSLogs/         │         │ CSV report   │
//! │   objects    │           │   {Y}/{m}/{d}/   │         │ (S3)         │
//! └──────────────┘           └──────────────────┘         └──────────────┘
//!        │                            │                          ▲
//!        ▼                            ▼                          │
//! ┌──────────────┐           ┌──────────────────┐         ┌──────────────┐
//! │ Auditor      │──────────▶│ Uploader         │         │ Report       │
//! │ (window)     │           │ Resolver         │         │ Writer       │
//! └──────────────┘           └──────────────────┘         └──────────────┘
//!        │                     │       │       │                 ▲
//!        │                     ▼       ▼       ▼                 │
//!        │              Partition  Lister  Decoder/Matcher       │
//!        │                                                       │
//!        ├───────────────────────────────────────────────────────┘
//!        ▼
//! ┌──────────────┐
//! │ Notifier     │
//! │ (SNS / log)  │
//! └──────────────┘
//! ```

pub mod auditor;
pub mod config;
pub mod decoder;
pub mod lister;
pub mod matcher;
pub mod notifier;
pub mod partition;
pub mod report;
pub mod resolver;
pub mod store;

#[cfg(test)]
mod testing;

pub use auditor::{AuditSummary, Auditor, BucketStatus};
pub use config::{Config, ConfigError, ConfigOverrides};
pub use matcher::{IdentitySource, Uploader};
pub use notifier::{LogNotifier, Notifier, SnsNotifier};
pub use report::AuditRow;
pub use decoder::LogFormat;
pub use resolver::{LogCache, ResolutionOutcome, TargetObject, UploaderResolver};
pub use store::{ObjectStore, S3ObjectStore, StoreError};
