//! Schema drift detection.

use tidemark_core::catalog::{Column, Partition, PartitionInput, Table};

/// Returns true if `stored` has the same columns as `current`, position by
/// position, comparing name and type. Comments are ignored.
#[must_use]
pub fn columns_in_sync(current: &[Column], stored: &[Column]) -> bool {
    current.len() == stored.len()
        && current
            .iter()
            .zip(stored)
            .all(|(a, b)| a.name == b.name && a.data_type == b.data_type)
}

/// Returns the update that brings `partition` in line with `table`'s current
/// schema, or `None` if it is already in sync.
///
/// The update keeps the partition's own location, parameters, and access
/// times.
#[must_use]
pub fn diff_partition(table: &Table, partition: &Partition) -> Option<PartitionInput> {
    if columns_in_sync(&table.storage.columns, &partition.storage.columns) {
        None
    } else {
        Some(partition.rebased_on(&table.storage))
    }
}
