//! Catalog contract: databases, tables, and time-partitions.
//!
//! The catalog is an external metadata service. tidemark only needs a narrow slice
//! of it: paginated listing of tables and partitions, single-table lookup, batch
//! partition creation, and single-partition descriptor updates. Every mutation is
//! idempotent upstream, so duplicate calls from overlapping invocations are safe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::timebin::{PartitionFilter, TimeBin};

/// A typed column in a storage descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column type (catalog type string, e.g. `string`, `bigint`).
    #[serde(rename = "type")]
    pub data_type: String,
    /// Optional column comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Column {
    /// Creates a column without a comment.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            comment: None,
        }
    }
}

/// Schema and physical layout of a table or partition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageDescriptor {
    /// Ordered typed columns.
    pub columns: Vec<Column>,
    /// Object-store location (e.g. `s3://bucket/logs/table/`).
    pub location: String,
    /// Input format class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_format: Option<String>,
    /// Output format class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    /// Serialization library.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serde_library: Option<String>,
    /// Serialization parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub serde_parameters: BTreeMap<String, String>,
}

impl StorageDescriptor {
    /// Returns a copy of this descriptor pointing at a different location.
    #[must_use]
    pub fn with_location(&self, location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..self.clone()
        }
    }
}

/// A catalog table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Owning database.
    pub database: String,
    /// Table name.
    pub name: String,
    /// When the table was created.
    pub created_at: DateTime<Utc>,
    /// Partition granularity.
    #[serde(default)]
    pub bin: TimeBin,
    /// Current storage descriptor. Its location is the table's base location.
    pub storage: StorageDescriptor,
}

impl Table {
    /// Returns the table's base location.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.storage.location
    }

    /// Returns the location of the partition whose bin contains `t`.
    #[must_use]
    pub fn partition_location(&self, t: DateTime<Utc>) -> String {
        let base = self.location();
        let path = self.bin.path(t);
        if base.ends_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// Builds the creation input for the partition whose bin contains `t`,
    /// using the current descriptor as a template.
    #[must_use]
    pub fn partition_input(&self, t: DateTime<Utc>) -> PartitionInput {
        PartitionInput {
            values: self.bin.to_key(t),
            storage: self.storage.with_location(self.partition_location(t)),
            parameters: BTreeMap::new(),
            last_access_time: None,
            last_analyzed_time: None,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

/// A catalog partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Ordered key values (time components).
    pub values: Vec<String>,
    /// The partition's own descriptor (may lag the table's).
    pub storage: StorageDescriptor,
    /// Free-form partition parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Last access time recorded by the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_time: Option<DateTime<Utc>>,
    /// Last time statistics were computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_analyzed_time: Option<DateTime<Utc>>,
}

impl Partition {
    /// Builds an update input replacing this partition's schema with `template`
    /// while keeping its own location and metadata.
    #[must_use]
    pub fn rebased_on(&self, template: &StorageDescriptor) -> PartitionInput {
        PartitionInput {
            values: self.values.clone(),
            storage: template.with_location(self.storage.location.clone()),
            parameters: self.parameters.clone(),
            last_access_time: self.last_access_time,
            last_analyzed_time: self.last_analyzed_time,
        }
    }
}

/// Input for creating or updating a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInput {
    /// Ordered key values.
    pub values: Vec<String>,
    /// Descriptor to store.
    pub storage: StorageDescriptor,
    /// Free-form partition parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Last access time to preserve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_time: Option<DateTime<Utc>>,
    /// Last analyzed time to preserve.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_analyzed_time: Option<DateTime<Utc>>,
}

impl PartitionInput {
    /// Materializes the input as a stored partition.
    #[must_use]
    pub fn into_partition(self) -> Partition {
        Partition {
            values: self.values,
            storage: self.storage,
            parameters: self.parameters,
            last_access_time: self.last_access_time,
            last_analyzed_time: self.last_analyzed_time,
        }
    }
}

/// Error code for one item of a batch partition creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionErrorCode {
    /// The partition already exists. Benign for idempotent creation.
    AlreadyExists,
    /// The request for this item was invalid.
    InvalidInput,
    /// The catalog failed internally for this item.
    Internal,
}

/// Per-item failure reported by [`Catalog::batch_create_partitions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionError {
    /// Key of the partition that failed.
    pub values: Vec<String>,
    /// Failure classification.
    pub code: PartitionErrorCode,
    /// Human-readable message from the catalog.
    pub message: String,
}

impl PartitionError {
    /// Returns true for the benign "already exists" outcome.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.code == PartitionErrorCode::AlreadyExists
    }
}

impl fmt::Display for PartitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition {} failed ({:?}): {}",
            self.values.join("/"),
            self.code,
            self.message
        )
    }
}

/// Request for one page of tables.
#[derive(Debug, Clone, Default)]
pub struct ListTablesRequest {
    /// Database to list.
    pub database: String,
    /// Only tables whose name starts with this prefix.
    pub name_prefix: Option<String>,
    /// Token returned by the previous page.
    pub page_token: Option<String>,
    /// Maximum tables per page.
    pub page_size: usize,
}

/// Request for one page of partitions.
#[derive(Debug, Clone, Default)]
pub struct ListPartitionsRequest {
    /// Owning database.
    pub database: String,
    /// Table name.
    pub table: String,
    /// Optional key-range filter.
    pub filter: Option<PartitionFilter>,
    /// Token returned by the previous page.
    pub page_token: Option<String>,
    /// Maximum partitions per page.
    pub page_size: usize,
}

/// One page of a paginated catalog listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page, in ascending key order.
    pub items: Vec<T>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// Returns true if no further pages follow.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.next_token.is_none()
    }
}

/// Catalog service contract.
///
/// Implementations must return partitions in ascending key order within a table.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// Lists one page of tables in a database.
    async fn list_tables(&self, request: ListTablesRequest) -> Result<Page<Table>>;

    /// Gets one table.
    ///
    /// Returns `Error::ResourceNotFound` if the table does not exist.
    async fn get_table(&self, database: &str, name: &str) -> Result<Table>;

    /// Lists one page of a table's partitions.
    async fn list_partitions(&self, request: ListPartitionsRequest) -> Result<Page<Partition>>;

    /// Creates partitions in one call.
    ///
    /// Per-item failures (including "already exists") are returned rather than
    /// raised; an `Err` means the whole call failed.
    async fn batch_create_partitions(
        &self,
        database: &str,
        table: &str,
        inputs: Vec<PartitionInput>,
    ) -> Result<Vec<PartitionError>>;

    /// Replaces one partition's descriptor and metadata.
    async fn update_partition(
        &self,
        database: &str,
        table: &str,
        input: PartitionInput,
    ) -> Result<()>;
}
