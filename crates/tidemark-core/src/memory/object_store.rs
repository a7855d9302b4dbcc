use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::poison_err;
use crate::error::{Error, Result};
use crate::object_store::{ListObjectsRequest, ObjectLocation, ObjectMeta, ObjectPage, ObjectStore};

/// In-memory object store holding only keys and sizes.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, BTreeMap<String, u64>>>,
    failing_prefixes: RwLock<Vec<String>>,
    list_calls: AtomicUsize,
    list_latency: Option<Duration>,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every listing call by `latency` (tokio time).
    #[must_use]
    pub const fn with_list_latency(mut self, latency: Duration) -> Self {
        self.list_latency = Some(latency);
        self
    }

    /// Makes listings under a URL-style `prefix` fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_prefix(&self, prefix: impl Into<String>) -> Result<()> {
        let mut failing = self.failing_prefixes.write().map_err(poison_err)?;
        failing.push(prefix.into());
        Ok(())
    }

    /// Stores an object of `size` bytes at a URL-style location
    /// (`s3://bucket/key`).
    ///
    /// # Errors
    ///
    /// Returns an error if the location cannot be parsed or the lock is poisoned.
    pub fn put(&self, location: &str, size: u64) -> Result<()> {
        let location = ObjectLocation::parse(location)?;
        let mut objects = self.objects.write().map_err(poison_err)?;
        objects
            .entry(location.bucket)
            .or_default()
            .insert(location.key, size);
        Ok(())
    }

    /// Returns how many listing calls were made.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_objects(&self, request: ListObjectsRequest) -> Result<ObjectPage> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.list_latency {
            tokio::time::sleep(latency).await;
        }

        let location = format!("s3://{}/{}", request.bucket, request.prefix);
        let failing = self.failing_prefixes.read().map_err(poison_err)?;
        if failing.iter().any(|prefix| location.starts_with(prefix.as_str())) {
            return Err(Error::object_store(format!("injected listing failure for {location}")));
        }
        drop(failing);

        let objects = self.objects.read().map_err(poison_err)?;

        let mut matching = objects
            .get(&request.bucket)
            .into_iter()
            .flat_map(|keys| keys.range(request.prefix.clone()..))
            .take_while(|(key, _)| key.starts_with(&request.prefix))
            .filter(|(key, _)| {
                request
                    .continuation_token
                    .as_ref()
                    .is_none_or(|after| *key > after)
            })
            .map(|(key, size)| ObjectMeta {
                key: key.clone(),
                size: *size,
                last_modified: None,
            });

        let page: Vec<ObjectMeta> = matching.by_ref().take(request.max_keys.max(1)).collect();
        let has_more = matching.next().is_some();
        drop(objects);

        let next_token = if has_more {
            page.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ObjectPage {
            objects: page,
            next_token,
        })
    }
}
