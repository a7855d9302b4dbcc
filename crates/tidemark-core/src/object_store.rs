//! Object store contract used to probe for data under a prefix.
//!
//! tidemark never reads object contents. The only question it asks the store is
//! "is there at least one non-empty object under this prefix?", answered with small
//! bounded listings and an early exit on the first hit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::{Error, Result};

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object key within the bucket.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Request for one page of an object listing.
#[derive(Debug, Clone)]
pub struct ListObjectsRequest {
    /// Bucket to list.
    pub bucket: String,
    /// Key prefix.
    pub prefix: String,
    /// Maximum keys to return.
    pub max_keys: usize,
    /// Token returned by the previous page.
    pub continuation_token: Option<String>,
}

/// One page of an object listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    /// Objects on this page, in ascending key order.
    pub objects: Vec<ObjectMeta>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// Object store contract.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Lists one page of objects under a prefix.
    async fn list_objects(&self, request: ListObjectsRequest) -> Result<ObjectPage>;
}

/// Returns true if at least one non-empty object exists under `location`.
///
/// Pages through the listing `page_size` keys at a time and stops at the first
/// object with a non-zero size.
///
/// # Errors
///
/// Returns an error if the location cannot be parsed or a listing call fails.
pub async fn has_data(store: &dyn ObjectStore, location: &str, page_size: usize) -> Result<bool> {
    let location = ObjectLocation::parse(location)?;
    let mut token = None;
    loop {
        let page = store
            .list_objects(ListObjectsRequest {
                bucket: location.bucket.clone(),
                prefix: location.key.clone(),
                max_keys: page_size.max(1),
                continuation_token: token.take(),
            })
            .await?;

        if page.objects.iter().any(|o| o.size > 0) {
            return Ok(true);
        }
        match page.next_token {
            Some(next) => token = Some(next),
            None => return Ok(false),
        }
    }
}

/// A bucket + key prefix parsed from a URL-style location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    /// URL scheme (`s3`, `gs`, ...).
    pub scheme: String,
    /// Bucket name.
    pub bucket: String,
    /// Key prefix within the bucket (no leading `/`).
    pub key: String,
}

impl ObjectLocation {
    /// Parses `scheme://bucket/key/prefix/`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` if the scheme or bucket is missing.
    pub fn parse(location: &str) -> Result<Self> {
        let (scheme, rest) = location.split_once("://").ok_or_else(|| {
            Error::InvalidInput(format!("location '{location}' has no scheme"))
        })?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if scheme.is_empty() || bucket.is_empty() {
            return Err(Error::InvalidInput(format!(
                "location '{location}' must look like scheme://bucket/prefix"
            )));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.trim_start_matches('/').to_string(),
        })
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_bucket_and_key() {
        let loc = ObjectLocation::parse("s3://data-lake/logs/aws_s3/year=2020/").unwrap();
        assert_eq!(loc.scheme, "s3");
        assert_eq!(loc.bucket, "data-lake");
        assert_eq!(loc.key, "logs/aws_s3/year=2020/");
        assert_eq!(loc.to_string(), "s3://data-lake/logs/aws_s3/year=2020/");
    }

    #[test]
    fn parse_accepts_bare_bucket() {
        let loc = ObjectLocation::parse("gs://bucket").unwrap();
        assert_eq!(loc.bucket, "bucket");
        assert_eq!(loc.key, "");
    }

    #[test]
    fn parse_rejects_missing_scheme_or_bucket() {
        assert!(ObjectLocation::parse("bucket/key").is_err());
        assert!(ObjectLocation::parse("s3:///key").is_err());
    }
}
