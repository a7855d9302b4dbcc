use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use super::poison_err;
use crate::catalog::{
    Catalog, ListPartitionsRequest, ListTablesRequest, Page, Partition, PartitionError,
    PartitionErrorCode, PartitionInput, Table,
};
use crate::error::{Error, Result};

type TableKey = (String, String);

/// In-memory catalog.
///
/// Pagination tokens are the last key of the previous page, so listings stay
/// stable while partitions are being created.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
    list_latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct CatalogState {
    tables: BTreeMap<TableKey, Table>,
    partitions: HashMap<TableKey, BTreeMap<Vec<String>, Partition>>,
    create_failures: HashMap<Vec<String>, PartitionErrorCode>,
    update_failures: Vec<Vec<String>>,
    updated: Vec<Vec<String>>,
    batch_create_calls: usize,
}

impl MemoryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every partition listing call by `latency` (tokio time).
    #[must_use]
    pub const fn with_list_latency(mut self, latency: Duration) -> Self {
        self.list_latency = Some(latency);
        self
    }

    /// Inserts or replaces a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put_table(&self, table: Table) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .tables
            .insert((table.database.clone(), table.name.clone()), table);
        Ok(())
    }

    /// Inserts or replaces a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn put_partition(&self, database: &str, table: &str, partition: Partition) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .partitions
            .entry((database.to_string(), table.to_string()))
            .or_default()
            .insert(partition.values.clone(), partition);
        Ok(())
    }

    /// Returns a table's partitions in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn partitions(&self, database: &str, table: &str) -> Result<Vec<Partition>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .partitions
            .get(&(database.to_string(), table.to_string()))
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Makes batch creation of the partition with key `values` fail with `code`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_create(&self, values: Vec<String>, code: PartitionErrorCode) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.create_failures.insert(values, code);
        Ok(())
    }

    /// Makes updates of the partition with key `values` fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_update(&self, values: Vec<String>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.update_failures.push(values);
        Ok(())
    }

    /// Returns the keys of every successful partition update, in call order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn updated_keys(&self) -> Result<Vec<Vec<String>>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.updated.clone())
    }

    /// Returns how many batch-create calls were made.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn batch_create_calls(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.batch_create_calls)
    }
}

fn decode_token(token: Option<&str>) -> Option<Vec<String>> {
    token.map(|t| t.split('/').map(str::to_string).collect())
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn list_tables(&self, request: ListTablesRequest) -> Result<Page<Table>> {
        let state = self.state.read().map_err(poison_err)?;
        let prefix = request.name_prefix.as_deref().unwrap_or("");
        let page_size = request.page_size.max(1);

        let mut matching = state
            .tables
            .iter()
            .filter(|((db, name), _)| db == &request.database && name.starts_with(prefix))
            .filter(|((_, name), _)| {
                request
                    .page_token
                    .as_deref()
                    .is_none_or(|after| name.as_str() > after)
            })
            .map(|(_, table)| table.clone());

        let items: Vec<Table> = matching.by_ref().take(page_size).collect();
        let has_more = matching.next().is_some();
        drop(state);

        let next_token = if has_more {
            items.last().map(|t| t.name.clone())
        } else {
            None
        };
        Ok(Page { items, next_token })
    }

    async fn get_table(&self, database: &str, name: &str) -> Result<Table> {
        let state = self.state.read().map_err(poison_err)?;
        state
            .tables
            .get(&(database.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::resource_not_found("table", format!("{database}.{name}")))
    }

    async fn list_partitions(&self, request: ListPartitionsRequest) -> Result<Page<Partition>> {
        if let Some(latency) = self.list_latency {
            tokio::time::sleep(latency).await;
        }

        let state = self.state.read().map_err(poison_err)?;
        let key = (request.database.clone(), request.table.clone());
        if !state.tables.contains_key(&key) {
            return Err(Error::resource_not_found(
                "table",
                format!("{}.{}", request.database, request.table),
            ));
        }

        let after = decode_token(request.page_token.as_deref());
        let page_size = request.page_size.max(1);
        let mut matching = state
            .partitions
            .get(&key)
            .into_iter()
            .flat_map(BTreeMap::values)
            .filter(|p| after.as_ref().is_none_or(|after| &p.values > after))
            .filter(|p| request.filter.as_ref().is_none_or(|f| f.matches(&p.values)))
            .cloned();

        let items: Vec<Partition> = matching.by_ref().take(page_size).collect();
        let has_more = matching.next().is_some();
        drop(state);

        let next_token = if has_more {
            items.last().map(|p| p.values.join("/"))
        } else {
            None
        };
        Ok(Page { items, next_token })
    }

    async fn batch_create_partitions(
        &self,
        database: &str,
        table: &str,
        inputs: Vec<PartitionInput>,
    ) -> Result<Vec<PartitionError>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let key = (database.to_string(), table.to_string());
        if !state.tables.contains_key(&key) {
            return Err(Error::resource_not_found("table", format!("{database}.{table}")));
        }
        state.batch_create_calls += 1;

        let mut errors = Vec::new();
        for input in inputs {
            if let Some(code) = state.create_failures.get(&input.values).cloned() {
                errors.push(PartitionError {
                    values: input.values,
                    code,
                    message: "injected failure".to_string(),
                });
                continue;
            }

            let partitions = state.partitions.entry(key.clone()).or_default();
            if partitions.contains_key(&input.values) {
                errors.push(PartitionError {
                    values: input.values,
                    code: PartitionErrorCode::AlreadyExists,
                    message: "partition already exists".to_string(),
                });
                continue;
            }
            partitions.insert(input.values.clone(), input.into_partition());
        }
        drop(state);

        Ok(errors)
    }

    async fn update_partition(
        &self,
        database: &str,
        table: &str,
        input: PartitionInput,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.update_failures.contains(&input.values) {
            return Err(Error::catalog(format!(
                "injected update failure for {}",
                input.values.join("/")
            )));
        }

        let key = (database.to_string(), table.to_string());
        let existing = state
            .partitions
            .get_mut(&key)
            .and_then(|p| p.get_mut(&input.values))
            .ok_or_else(|| Error::resource_not_found("partition", input.values.join("/")))?;
        let values = input.values.clone();
        *existing = input.into_partition();
        state.updated.push(values);
        drop(state);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, StorageDescriptor};
    use crate::timebin::TimeBin;
    use chrono::{TimeZone, Utc};

    fn table(name: &str) -> Table {
        Table {
            database: "logs".into(),
            name: name.into(),
            created_at: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            bin: TimeBin::Hourly,
            storage: StorageDescriptor {
                columns: vec![Column::new("col", "string")],
                location: format!("s3://bucket/logs/{name}/"),
                ..StorageDescriptor::default()
            },
        }
    }

    fn seeded(hours: u32) -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        let t = table("events");
        catalog.put_table(t.clone()).unwrap();
        for h in 0..hours {
            let at = Utc.with_ymd_and_hms(2020, 1, 1, h, 0, 0).unwrap();
            catalog
                .put_partition("logs", "events", t.partition_input(at).into_partition())
                .unwrap();
        }
        catalog
    }

    #[tokio::test]
    async fn list_partitions_paginates_in_key_order() {
        let catalog = seeded(5);
        let mut token = None;
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = catalog
                .list_partitions(ListPartitionsRequest {
                    database: "logs".into(),
                    table: "events".into(),
                    page_token: token.take(),
                    page_size: 2,
                    ..ListPartitionsRequest::default()
                })
                .await
                .unwrap();
            pages += 1;
            seen.extend(page.items.into_iter().map(|p| p.values[3].clone()));
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(seen, ["00", "01", "02", "03", "04"]);
    }

    #[tokio::test]
    async fn batch_create_reports_existing_items() {
        let catalog = seeded(1);
        let t = table("events");
        let inputs = (0..2)
            .map(|h| t.partition_input(Utc.with_ymd_and_hms(2020, 1, 1, h, 0, 0).unwrap()))
            .collect();

        let errors = catalog
            .batch_create_partitions("logs", "events", inputs)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_already_exists());
        assert_eq!(catalog.partitions("logs", "events").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_table_is_not_found() {
        let catalog = MemoryCatalog::new();
        let err = catalog.get_table("logs", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_tables_filters_by_prefix() {
        let catalog = MemoryCatalog::new();
        for name in ["aws_s3", "aws_vpc", "gcp_audit"] {
            catalog.put_table(table(name)).unwrap();
        }
        let page = catalog
            .list_tables(ListTablesRequest {
                database: "logs".into(),
                name_prefix: Some("aws_".into()),
                page_token: None,
                page_size: 10,
            })
            .await
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["aws_s3", "aws_vpc"]);
        assert!(page.is_last());
    }
}
