//! Audit rows and their CSV / notification renderings.

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

/// Timestamp layout used in the report and its key
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Report column names, in order
pub const CSV_HEADER: [&str; 7] = [
    "Bucket_name",
    "Prefix",
    "Filename",
    "Uploader",
    "Datetime_file_landed",
    "Datetime_lambda_ran",
    "Error_if_any",
];

/// Errors raised while rendering the report
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("CSV serialization failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV buffer flush failed: {0}")]
    Flush(String),
}

/// One line of the audit report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub bucket: String,
    /// Directory part of the object key (empty for top-level keys)
    pub prefix: String,
    /// Last path segment of the object key
    pub filename: String,
    pub uploader: String,
    pub size_bytes: Option<u64>,
    /// `None` for rows describing a bucket-level failure
    pub landed_at: Option<DateTime<Utc>>,
    pub ran_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl AuditRow {
    /// Size rendered the way notifications show it, e.g. `1.50 KB`
    pub fn size_kb(&self) -> Option<String> {
        self.size_bytes
            .map(|bytes| format!("{:.2} KB", bytes as f64 / 1024.0))
    }

    /// The row as a metadata notification body
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "Bucket_name": self.bucket,
            "Prefix": self.prefix,
            "Filename": self.filename,
            "Uploader": self.uploader,
            "File_size": self.size_kb(),
            "Datetime_file_landed": self.landed_at.map(format_timestamp),
            "Datetime_lambda_ran": format_timestamp(self.ran_at),
            "Error_if_any": self.error,
        })
    }
}

/// Split an object key into its directory part and file name.
///
/// `csv/in/a.csv` -> (`csv/in`, `a.csv`); `a.csv` -> (``, `a.csv`);
/// `csv/in/` -> (`csv/in`, ``).
pub fn split_key(key: &str) -> (&str, &str) {
    match key.rsplit_once('/') {
        Some((prefix, filename)) => (prefix, filename),
        None => ("", key),
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Key of the report written for a run started at `ran_at`
pub fn report_key(output_prefix: &str, ran_at: DateTime<Utc>) -> String {
    format!("{}{}_file_metadata.csv", output_prefix, format_timestamp(ran_at))
}

/// Render rows as CSV with a header line
pub fn render_csv(rows: &[AuditRow]) -> Result<Vec<u8>, ReportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;

    for row in rows {
        let landed = row.landed_at.map(format_timestamp).unwrap_or_default();
        let ran = format_timestamp(row.ran_at);
        writer.write_record([
            row.bucket.as_str(),
            row.prefix.as_str(),
            row.filename.as_str(),
            row.uploader.as_str(),
            landed.as_str(),
            ran.as_str(),
            row.error.as_deref().unwrap_or(""),
        ])?;
    }

    writer
        .into_inner()
        .map_err(|e| ReportError::Flush(e.error().to_string()))
}

/// Plain-text run summary used as a notification body
pub fn render_summary(rows: &[AuditRow]) -> String {
    let mut summary = format!("Upload audit found {} file(s):\n", rows.len());
    for row in rows {
        let location = if row.prefix.is_empty() {
            format!("{}/{}", row.bucket, row.filename)
        } else {
            format!("{}/{}/{}", row.bucket, row.prefix, row.filename)
        };
        summary.push_str(&format!("\n- {} uploaded by {}", location, row.uploader));
        if let Some(ref error) = row.error {
            summary.push_str(&format!(" (error: {})", error));
        }
    }
    summary
}
