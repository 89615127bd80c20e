//! Paginated, recency-filtered object listing.

use crate::store::{ObjectStore, ObjectSummary, StoreError};
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use tracing::{trace, warn};

/// List objects under `prefix`, following continuation tokens until the
/// listing is exhausted.
///
/// Objects are yielded lazily in the order the store returns them. When
/// `modified_since` is set, objects last modified before it (or without a
/// modification time) are skipped. Directory markers (keys ending with `/`)
/// are always skipped. The first failing page ends the stream with an error.
///
/// # Example
///
/// ```ignore
/// use futures::{pin_mut, StreamExt};
///
/// let logs = list_recent_objects(store, "trail-logs", "AWSLogs/2024/06/15/", Some(cutoff));
/// pin_mut!(logs);
///
/// while let Some(obj) = logs.next().await {
///     let obj = obj?;
///     println!("{} ({} bytes)", obj.key, obj.size);
/// }
/// ```
pub fn list_recent_objects<'a>(
    store: &'a dyn ObjectStore,
    bucket: &'a str,
    prefix: &'a str,
    modified_since: Option<DateTime<Utc>>,
) -> impl Stream<Item = Result<ObjectSummary, StoreError>> + 'a {
    try_stream! {
        let mut continuation_token: Option<String> = None;

        loop {
            let page = store.list_page(bucket, prefix, continuation_token.take()).await?;

            for obj in page.objects {
                if obj.key.is_empty() || obj.key.ends_with('/') {
                    continue;
                }

                if let Some(cutoff) = modified_since {
                    match obj.last_modified {
                        Some(modified) if modified >= cutoff => {}
                        _ => {
                            trace!(key = %obj.key, "Skipping object outside recency window");
                            continue;
                        }
                    }
                }

                yield obj;
            }

            match page.next_continuation_token {
                Some(token) if !token.is_empty() => continuation_token = Some(token),
                Some(_) => {
                    warn!(bucket = %bucket, prefix = %prefix, "Listing returned an empty continuation token");
                    break;
                }
                None => break,
            }
        }
    }
}
