//! Paginated table and partition scanning.
//!
//! A producer task fetches pages and hands them to the consumer over a
//! one-slot channel, so at most one page is prefetched. The producer stops
//! quietly when the consumer goes away. Cancellation, the deadline, and
//! catalog failures are reported by [`PageStream::finish`], so a consumer
//! never mistakes an interrupted scan for a complete one.

use std::future::Future;
use std::sync::Arc;

use tidemark_core::catalog::{
    Catalog, ListPartitionsRequest, ListTablesRequest, Page, Partition, Table,
};
use tidemark_core::timebin::PartitionFilter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::DropGuard;

use crate::context::TaskContext;
use crate::error::{Error, Result};

/// Stream of pages produced in the background.
#[derive(Debug)]
pub struct PageStream<T> {
    rx: mpsc::Receiver<Page<T>>,
    producer: JoinHandle<Result<()>>,
    _guard: DropGuard,
}

impl<T> PageStream<T> {
    /// Receives the next page, or `None` once the producer has stopped.
    pub async fn next(&mut self) -> Option<Page<T>> {
        self.rx.recv().await
    }

    /// Stops consuming and returns the producer's result.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the producer, if any.
    pub async fn finish(self) -> Result<()> {
        let Self { rx, producer, _guard } = self;
        drop(rx);
        match producer.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal {
                message: format!("page producer failed: {e}"),
            }),
        }
    }
}

/// Paginated scanner over the catalog.
#[derive(Clone)]
pub struct Scanner {
    catalog: Arc<dyn Catalog>,
    page_size: usize,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    /// Creates a scanner.
    #[must_use]
    pub fn new(catalog: Arc<dyn Catalog>, page_size: usize) -> Self {
        Self {
            catalog,
            page_size: page_size.max(1),
        }
    }

    /// Scans the tables of `database`, optionally restricted to a name prefix,
    /// starting after `start_token`.
    #[must_use]
    pub fn tables(
        &self,
        ctx: &TaskContext,
        database: &str,
        name_prefix: Option<&str>,
        start_token: Option<String>,
    ) -> PageStream<Table> {
        let catalog = Arc::clone(&self.catalog);
        let request = ListTablesRequest {
            database: database.to_string(),
            name_prefix: name_prefix.map(str::to_string),
            page_token: None,
            page_size: self.page_size,
        };
        spawn_pages(ctx, start_token, move |token| {
            let catalog = Arc::clone(&catalog);
            let request = ListTablesRequest {
                page_token: token,
                ..request.clone()
            };
            async move { catalog.list_tables(request).await }
        })
    }

    /// Scans the partitions of `table` in ascending key order, optionally
    /// filtered, starting after `start_token`.
    #[must_use]
    pub fn partitions(
        &self,
        ctx: &TaskContext,
        table: &Table,
        filter: Option<PartitionFilter>,
        start_token: Option<String>,
    ) -> PageStream<Partition> {
        let catalog = Arc::clone(&self.catalog);
        let request = ListPartitionsRequest {
            database: table.database.clone(),
            table: table.name.clone(),
            filter,
            page_token: None,
            page_size: self.page_size,
        };
        spawn_pages(ctx, start_token, move |token| {
            let catalog = Arc::clone(&catalog);
            let request = ListPartitionsRequest {
                page_token: token,
                ..request.clone()
            };
            async move { catalog.list_partitions(request).await }
        })
    }
}

fn spawn_pages<T, F, Fut>(ctx: &TaskContext, start_token: Option<String>, mut fetch: F) -> PageStream<T>
where
    T: Send + 'static,
    F: FnMut(Option<String>) -> Fut + Send + 'static,
    Fut: Future<Output = tidemark_core::Result<Page<T>>> + Send,
{
    let ctx = ctx.child();
    let guard = ctx.drop_guard();
    let (tx, rx) = mpsc::channel(1);

    let producer = tokio::spawn(async move {
        let mut token = start_token;
        loop {
            let page = match ctx.run(fetch(token.take())).await {
                Ok(page) => page,
                Err(e) => return Err(e),
            };
            let next = page.next_token.clone();
            tokio::select! {
                biased;
                () = ctx.cancelled() => return Err(Error::Cancelled),
                sent = tx.send(page) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
            match next {
                Some(next) => token = Some(next),
                None => return Ok(()),
            }
        }
    });

    PageStream {
        rx,
        producer,
        _guard: guard,
    }
}
