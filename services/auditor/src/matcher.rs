//! Matching of write events against a target object.

use crate::decoder::TrailEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Event name of an object write
pub const PUT_OBJECT_EVENT: &str = "PutObject";

/// Reported when a matching event carries no usable identity
pub const UNKNOWN_IDENTITY: &str = "Unknown";

/// Which identity field is reported as the uploader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// `userIdentity.userName`, falling back to the last ARN segment
    #[default]
    UserName,
    /// Always the last `/` segment of `userIdentity.arn`
    ArnSegment,
    /// The full ARN
    Arn,
}

impl FromStr for IdentitySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user_name" | "username" => Ok(IdentitySource::UserName),
            "arn_segment" => Ok(IdentitySource::ArnSegment),
            "arn" => Ok(IdentitySource::Arn),
            other => Err(format!(
                "'{}' is not one of user_name, arn_segment, arn",
                other
            )),
        }
    }
}

/// The identity behind a matching write event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Uploader {
    /// Display name reported as the uploader
    pub user_name: String,
    /// Full ARN of the actor, when present
    pub arn: Option<String>,
    /// When the write was recorded
    pub event_time: Option<DateTime<Utc>>,
}

/// Matches `PutObject` events for exactly one bucket and key
#[derive(Debug, Clone, Copy)]
pub struct EventMatcher<'a> {
    bucket: &'a str,
    key: &'a str,
    identity_source: IdentitySource,
}

impl<'a> EventMatcher<'a> {
    pub fn new(bucket: &'a str, key: &'a str, identity_source: IdentitySource) -> Self {
        Self {
            bucket,
            key,
            identity_source,
        }
    }

    /// True when the event is a `PutObject` on the target bucket and key.
    ///
    /// Both fields must be present and equal; a key that merely contains or
    /// is contained in the target key does not match.
    pub fn matches(&self, event: &TrailEvent) -> bool {
        if event.event_name.as_deref() != Some(PUT_OBJECT_EVENT) {
            return false;
        }

        let Some(params) = event.request_parameters.as_ref() else {
            return false;
        };

        params.bucket_name.as_deref() == Some(self.bucket) && params.key.as_deref() == Some(self.key)
    }

    /// The uploader if the event matches
    pub fn extract(&self, event: &TrailEvent) -> Option<Uploader> {
        if !self.matches(event) {
            return None;
        }

        let identity = event.user_identity.as_ref();
        let arn = identity
            .and_then(|i| i.arn.as_deref())
            .filter(|a| !a.is_empty());
        let user_name = identity
            .and_then(|i| i.user_name.as_deref())
            .filter(|u| !u.is_empty());

        let display = match self.identity_source {
            IdentitySource::UserName => user_name.or_else(|| arn.map(arn_display_name)),
            IdentitySource::ArnSegment => arn.map(arn_display_name),
            IdentitySource::Arn => arn,
        }
        .unwrap_or(UNKNOWN_IDENTITY);

        Some(Uploader {
            user_name: display.to_string(),
            arn: arn.map(String::from),
            event_time: event.event_time.as_deref().and_then(parse_event_time),
        })
    }
}

/// The last `/`-delimited segment of an ARN (`arn:aws:iam::1:user/team/alice`
/// -> `alice`)
pub fn arn_display_name(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

fn parse_event_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{RequestParameters, UserIdentity};
    use chrono::TimeZone;

    fn put_event(bucket: &str, key: &str, arn: Option<&str>, user_name: Option<&str>) -> TrailEvent {
        TrailEvent {
            event_name: Some(PUT_OBJECT_EVENT.to_string()),
            event_time: Some("2024-06-15T01:00:05Z".to_string()),
            request_parameters: Some(RequestParameters {
                bucket_name: Some(bucket.to_string()),
                key: Some(key.to_string()),
            }),
            user_identity: Some(UserIdentity {
                arn: arn.map(String::from),
                user_name: user_name.map(String::from),
            }),
        }
    }

    #[test]
    fn test_exact_match_required() {
        let event = put_event("b1", "a/b.csv", Some("arn:aws:iam::1:user/alice"), None);

        assert!(EventMatcher::new("b1", "a/b.csv", IdentitySource::UserName).matches(&event));
        assert!(!EventMatcher::new("b1", "a/b.csv.bak", IdentitySource::UserName).matches(&event));
        assert!(!EventMatcher::new("b1", "b.csv", IdentitySource::UserName).matches(&event));
        assert!(!EventMatcher::new("b1", "a/b", IdentitySource::UserName).matches(&event));
        assert!(!EventMatcher::new("b", "a/b.csv", IdentitySource::UserName).matches(&event));
        assert!(!EventMatcher::new("b10", "a/b.csv", IdentitySource::UserName).matches(&event));
    }

    #[test]
    fn test_other_event_names_ignored() {
        let mut event = put_event("b1", "f.csv", Some("arn:aws:iam::1:user/alice"), None);
        event.event_name = Some("GetObject".to_string());
        assert!(!EventMatcher::new("b1", "f.csv", IdentitySource::UserName).matches(&event));

        event.event_name = None;
        assert!(!EventMatcher::new("b1", "f.csv", IdentitySource::UserName).matches(&event));
    }

    #[test]
    fn test_missing_request_fields_never_match() {
        let mut event = put_event("b1", "f.csv", None, None);
        event.request_parameters = Some(RequestParameters {
            bucket_name: Some("b1".to_string()),
            key: None,
        });
        assert!(!EventMatcher::new("b1", "f.csv", IdentitySource::UserName).matches(&event));

        event.request_parameters = None;
        assert!(!EventMatcher::new("b1", "f.csv", IdentitySource::UserName).matches(&event));
    }

    #[test]
    fn test_user_name_preferred() {
        let event = put_event("b1", "f.csv", Some("arn:aws:iam::1:user/alice"), Some("alice.smith"));

        let uploader = EventMatcher::new("b1", "f.csv", IdentitySource::UserName)
            .extract(&event)
            .unwrap();

        assert_eq!(uploader.user_name, "alice.smith");
        assert_eq!(uploader.arn.as_deref(), Some("arn:aws:iam::1:user/alice"));
        assert_eq!(
            uploader.event_time,
            Some(Utc.with_ymd_and_hms(2024, 6, 15, 1, 0, 5).unwrap())
        );
    }

    #[test]
    fn test_arn_segment_when_user_name_absent() {
        let event = put_event(
            "b1",
            "f.csv",
            Some("arn:aws:sts::1:assumed-role/Uploader/bob@example.com"),
            None,
        );

        let uploader = EventMatcher::new("b1", "f.csv", IdentitySource::UserName)
            .extract(&event)
            .unwrap();

        assert_eq!(uploader.user_name, "bob@example.com");
    }

    #[test]
    fn test_identity_source_variants() {
        let event = put_event("b1", "f.csv", Some("arn:aws:iam::1:user/alice"), Some("a.smith"));

        let segment = EventMatcher::new("b1", "f.csv", IdentitySource::ArnSegment)
            .extract(&event)
            .unwrap();
        let full = EventMatcher::new("b1", "f.csv", IdentitySource::Arn)
            .extract(&event)
            .unwrap();

        assert_eq!(segment.user_name, "alice");
        assert_eq!(full.user_name, "arn:aws:iam::1:user/alice");
    }

    #[test]
    fn test_unknown_identity_fallback() {
        let mut event = put_event("b1", "f.csv", None, None);
        event.user_identity = None;
        event.event_time = Some("not a time".to_string());

        let uploader = EventMatcher::new("b1", "f.csv", IdentitySource::UserName)
            .extract(&event)
            .unwrap();

        assert_eq!(uploader.user_name, UNKNOWN_IDENTITY);
        assert!(uploader.arn.is_none());
        assert!(uploader.event_time.is_none());
    }

    #[test]
    fn test_arn_display_name() {
        assert_eq!(arn_display_name("arn:aws:iam::1:user/alice"), "alice");
        assert_eq!(arn_display_name("arn:aws:iam::1:user/team/alice"), "alice");
        assert_eq!(arn_display_name("arn:aws:iam::1:root"), "arn:aws:iam::1:root");
    }

    #[test]
    fn test_identity_source_from_str() {
        assert_eq!("user_name".parse(), Ok(IdentitySource::UserName));
        assert_eq!("ARN".parse(), Ok(IdentitySource::Arn));
        assert_eq!("arn_segment".parse(), Ok(IdentitySource::ArnSegment));
        assert!("email".parse::<IdentitySource>().is_err());
    }
}
