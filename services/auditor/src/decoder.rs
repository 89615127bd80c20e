//! Decoding of audit-trail log objects.
//!
//! A log object is either gzip-compressed or plain UTF-8 text with one entry
//! per line. Two layouts are understood:
//!
//! - CloudTrail: each line is a JSON batch (`{"Records": [...]}`) or a single
//!   flat event
//! - S3 server access logs: space-delimited records, with `[...]` and `"..."`
//!   fields kept whole
//!
//! Both decode into [`TrailEvent`]s. Bad lines are dropped one at a time.

use crate::matcher::PUT_OBJECT_EVENT;
use chrono::DateTime;
use flate2::read::MultiGzDecoder;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, trace};

/// Leading bytes of every gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Server access log operation for a single-request object write
pub const ACCESS_LOG_PUT_OPERATION: &str = "REST.PUT.OBJECT";

const ACCESS_LOG_TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

// Field positions in a server access log record
const ACCESS_BUCKET: usize = 1;
const ACCESS_TIME: usize = 2;
const ACCESS_REQUESTER: usize = 4;
const ACCESS_OPERATION: usize = 6;
const ACCESS_KEY: usize = 7;

/// Layout of the log objects being searched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// CloudTrail JSON, batched or flat
    #[default]
    CloudTrail,
    /// S3 server access log lines
    ServerAccess,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cloudtrail" => Ok(LogFormat::CloudTrail),
            "server_access" => Ok(LogFormat::ServerAccess),
            other => Err(format!("'{}' is not one of cloudtrail, server_access", other)),
        }
    }
}

/// Failures that make a whole log object unreadable.
///
/// The resolver logs these and moves on to the next object.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Gzip decompression failed: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("Log content is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A single audit-trail event. Every field is optional at decode time; the
/// matcher decides what is required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailEvent {
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub event_time: Option<String>,
    #[serde(default)]
    pub request_parameters: Option<RequestParameters>,
    #[serde(default)]
    pub user_identity: Option<UserIdentity>,
}

/// The `requestParameters` block of an S3 data event
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParameters {
    #[serde(default)]
    pub bucket_name: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// The `userIdentity` block of an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    #[serde(default)]
    pub arn: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
}

/// Events recovered from one log object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedLog {
    /// Events in file order
    pub events: Vec<TrailEvent>,
    /// Lines that were not valid JSON or had an unexpected shape
    pub skipped_lines: usize,
    /// Entries of a `Records` batch that could not be read as events
    pub skipped_records: usize,
}

/// Decode a raw log object.
///
/// Gzip is detected from the magic number rather than the key suffix, since
/// some deliveries store compressed content without a `.gz` extension.
pub fn decode(raw: &[u8], format: LogFormat) -> Result<DecodedLog, DecodeError> {
    let text = if raw.starts_with(&GZIP_MAGIC) {
        let mut inflated = Vec::new();
        MultiGzDecoder::new(raw)
            .read_to_end(&mut inflated)
            .map_err(DecodeError::Gzip)?;
        String::from_utf8(inflated)?
    } else {
        String::from_utf8(raw.to_vec())?
    };

    Ok(match format {
        LogFormat::CloudTrail => decode_lines(&text),
        LogFormat::ServerAccess => decode_access_log_lines(&text),
    })
}

/// Parse line-delimited JSON, skipping lines that fail.
pub fn decode_lines(text: &str) -> DecodedLog {
    let mut decoded = DecodedLog::default();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                debug!(line = index + 1, error = %e, "Skipping invalid JSON line");
                decoded.skipped_lines += 1;
                continue;
            }
        };

        match value {
            Value::Object(mut object) => match object.remove("Records") {
                Some(Value::Array(records)) => {
                    for record in records {
                        match serde_json::from_value::<TrailEvent>(record) {
                            Ok(event) => decoded.events.push(event),
                            Err(e) => {
                                trace!(line = index + 1, error = %e, "Skipping unreadable record");
                                decoded.skipped_records += 1;
                            }
                        }
                    }
                }
                Some(_) => {
                    debug!(line = index + 1, "Skipping line whose Records field is not an array");
                    decoded.skipped_lines += 1;
                }
                None => match serde_json::from_value::<TrailEvent>(Value::Object(object)) {
                    Ok(event) => decoded.events.push(event),
                    Err(e) => {
                        debug!(line = index + 1, error = %e, "Skipping unreadable event line");
                        decoded.skipped_lines += 1;
                    }
                },
            },
            _ => {
                debug!(line = index + 1, "Skipping line that is not a JSON object");
                decoded.skipped_lines += 1;
            }
        }
    }

    decoded
}

/// Parse S3 server access log lines, skipping lines that are too short.
///
/// `REST.PUT.OBJECT` records become `PutObject` events; other operations keep
/// their operation name and are ignored by the matcher. The key field is
/// URL-encoded in the log and is decoded here. A requester that is an ARN is
/// reported as the ARN, a canonical user id as the user name, and `-`
/// (anonymous) as no identity.
pub fn decode_access_log_lines(text: &str) -> DecodedLog {
    let mut decoded = DecodedLog::default();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields = split_access_log_fields(line);
        if fields.len() <= ACCESS_KEY {
            debug!(line = index + 1, fields = fields.len(), "Skipping short access log line");
            decoded.skipped_lines += 1;
            continue;
        }

        let key = match present(fields[ACCESS_KEY]) {
            Some(raw) => match percent_decode_str(raw).decode_utf8() {
                Ok(key) => Some(key.into_owned()),
                Err(e) => {
                    debug!(line = index + 1, error = %e, "Skipping access log line with undecodable key");
                    decoded.skipped_lines += 1;
                    continue;
                }
            },
            None => None,
        };

        let operation = fields[ACCESS_OPERATION];
        let event_name = if operation == ACCESS_LOG_PUT_OPERATION {
            PUT_OBJECT_EVENT.to_string()
        } else {
            operation.to_string()
        };

        let requester = present(fields[ACCESS_REQUESTER]);
        let user_identity = requester.map(|requester| {
            if requester.starts_with("arn:") {
                UserIdentity {
                    arn: Some(requester.to_string()),
                    user_name: None,
                }
            } else {
                UserIdentity {
                    arn: None,
                    user_name: Some(requester.to_string()),
                }
            }
        });

        let event_time = DateTime::parse_from_str(fields[ACCESS_TIME], ACCESS_LOG_TIME_FORMAT)
            .ok()
            .map(|t| t.to_rfc3339());

        decoded.events.push(TrailEvent {
            event_name: Some(event_name),
            event_time,
            request_parameters: Some(RequestParameters {
                bucket_name: present(fields[ACCESS_BUCKET]).map(String::from),
                key,
            }),
            user_identity,
        });
    }

    decoded
}

/// Split an access log record on spaces, keeping `[...]` and `"..."` fields
/// whole (without their delimiters). An unterminated field runs to the end of
/// the line.
fn split_access_log_fields(line: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut rest = line.trim_start();

    while !rest.is_empty() {
        let closing = match rest.as_bytes()[0] {
            b'[' => Some(']'),
            b'"' => Some('"'),
            _ => None,
        };

        let (field, remainder) = match closing {
            Some(close) => {
                let body = &rest[1..];
                match body.find(close) {
                    Some(end) => (&body[..end], &body[end + 1..]),
                    None => (body, ""),
                }
            }
            None => match rest.find(' ') {
                Some(end) => (&rest[..end], &rest[end..]),
                None => (rest, ""),
            },
        };

        fields.push(field);
        rest = remainder.trim_start();
    }

    fields
}

fn present(field: &str) -> Option<&str> {
    (!field.is_empty() && field != "-").then_some(field)
}
