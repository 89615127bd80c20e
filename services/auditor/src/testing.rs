//! In-memory collaborators for unit tests.

use crate::notifier::{Notifier, NotifyError};
use crate::store::{ListPage, ObjectStore, ObjectSummary, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Clone)]
struct StoredObject {
    body: Bytes,
    last_modified: DateTime<Utc>,
}

/// Object store held in memory, paginated like S3 (lexicographic key order).
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    page_size: usize,
    failing_lists: Mutex<HashSet<String>>,
    failing_gets: Mutex<HashSet<String>>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size: 1000,
            failing_lists: Mutex::new(HashSet::new()),
            failing_gets: Mutex::new(HashSet::new()),
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn put(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                last_modified,
            },
        );
    }

    /// Make every listing of `bucket` fail
    pub fn fail_list(&self, bucket: &str) {
        self.failing_lists.lock().unwrap().insert(bucket.to_string());
    }

    /// Make reads of `key` fail
    pub fn fail_get(&self, key: &str) {
        self.failing_gets.lock().unwrap().insert(key.to_string());
    }

    pub fn body(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.body.clone())
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_lists.lock().unwrap().contains(bucket) {
            return Err(StoreError::List {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                message: "AccessDenied".to_string(),
            });
        }

        let objects = self.objects.lock().unwrap();
        let mut matching = objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .filter(|((_, k), _)| match &continuation_token {
                Some(after) => k.as_str() > after.as_str(),
                None => true,
            })
            .map(|((_, k), o)| ObjectSummary {
                key: k.clone(),
                size: o.body.len() as u64,
                last_modified: Some(o.last_modified),
            });

        let page: Vec<ObjectSummary> = matching.by_ref().take(self.page_size).collect();
        let next_continuation_token = match matching.next() {
            Some(_) => page.last().map(|o| o.key.clone()),
            None => None,
        };

        Ok(ListPage {
            objects: page,
            next_continuation_token,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        if self.failing_gets.lock().unwrap().contains(key) {
            return Err(StoreError::Get {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "InternalError".to_string(),
            });
        }

        self.body(bucket, key).ok_or_else(|| StoreError::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message: "NoSuchKey".to_string(),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<(), StoreError> {
        self.put(bucket, key, body, Utc::now());
        Ok(())
    }
}

/// Notifier that keeps every published message
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(subject, body)` pairs in publish order
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn bodies_containing(&self, needle: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, body)| body.contains(needle))
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, subject: &str, body: &str) -> Result<(), NotifyError> {
        self.messages
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Gzip-compress a string
pub fn gzip(content: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// One CloudTrail `PutObject` batch line
pub fn put_object_line(bucket: &str, key: &str, arn: &str) -> String {
    serde_json::json!({
        "Records": [{
            "eventName": "PutObject",
            "eventTime": "2024-06-15T01:00:05Z",
            "requestParameters": { "bucketName": bucket, "key": key },
            "userIdentity": { "arn": arn }
        }]
    })
    .to_string()
}

/// One S3 server access log record. `key` is written URL-encoded, as S3 does.
pub fn access_log_line(bucket: &str, key: &str, requester: &str, operation: &str) -> String {
    let encoded = key.replace(' ', "%20");
    format!(
        "79a59df900b949e55d96a1e698fbacedfd6e09d98eacf8f8d5218e7cd47ef2be {bucket} \
         [15/Jun/2024:01:00:05 +0000] 192.0.2.3 {requester} 3E57427F3EXAMPLE {operation} \
         {encoded} \"PUT /{bucket}/{encoded} HTTP/1.1\" 200 - - 7 70 10 \"-\" \
         \"aws-cli/2.15.0 Python/3.11\" - s9lzHYrFp76ZVxRcpX9+5cjAnEH2ROuNkd2BHfIa6UkFVdtjf5mKR3/eTPFvsiP/XV/VLi31234= \
         SigV4 ECDHE-RSA-AES128-GCM-SHA256 AuthHeader {bucket}.s3.us-east-1.amazonaws.com TLSv1.2 - -"
    )
}
