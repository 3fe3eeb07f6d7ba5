//! Chunked bulk writes that tolerate partial failure.
//!
//! Items are committed in chunks of `batch_size`; a chunk that fails to commit
//! counts toward `failed` and the remaining chunks still run.

use std::fmt::Display;
use std::future::Future;

use serde::Serialize;

use crate::store::{Document, Store, WriteBatch};

pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub chunk: usize,
    pub chunks: usize,
    pub written: usize,
    pub failed: usize,
}

pub struct BatchWriteOptions<'a> {
    pub batch_size: usize,
    pub on_progress: Option<&'a (dyn Fn(BatchProgress) + Send + Sync)>,
}

impl Default for BatchWriteOptions<'_> {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            on_progress: None,
        }
    }
}

impl BatchWriteOptions<'_> {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchWriteResult {
    pub written: usize,
    pub failed: usize,
    pub chunks: usize,
    pub errors: Vec<String>,
}

/// Split `items` into chunks and hand each chunk to `write_fn` as one commit.
pub async fn write_batch<T, F, Fut, E>(
    items: Vec<T>,
    mut write_fn: F,
    options: BatchWriteOptions<'_>,
) -> BatchWriteResult
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let batch_size = options.batch_size.max(1);
    let chunks = items.len().div_ceil(batch_size);
    let mut result = BatchWriteResult {
        chunks,
        ..Default::default()
    };

    let mut items = items.into_iter().peekable();
    let mut chunk_index = 0;
    while items.peek().is_some() {
        let chunk: Vec<T> = items.by_ref().take(batch_size).collect();
        let size = chunk.len();
        chunk_index += 1;

        match write_fn(chunk).await {
            Ok(()) => result.written += size,
            Err(e) => {
                tracing::warn!("Batch chunk {chunk_index}/{chunks} ({size} items) failed: {e}");
                result.failed += size;
                result.errors.push(e.to_string());
            }
        }

        if let Some(on_progress) = options.on_progress {
            on_progress(BatchProgress {
                chunk: chunk_index,
                chunks,
                written: result.written,
                failed: result.failed,
            });
        }
    }

    result
}

/// Upsert keyed documents into `collection`, one [`WriteBatch`] per chunk.
/// The chunk size never exceeds what the store accepts in one batch.
pub async fn write_documents(
    store: &dyn Store,
    collection: &str,
    docs: Vec<(String, Document)>,
    options: BatchWriteOptions<'_>,
) -> BatchWriteResult {
    let options = BatchWriteOptions {
        batch_size: options.batch_size.min(store.max_batch_size()),
        ..options
    };

    write_batch(
        docs,
        |chunk| async move {
            let mut batch = WriteBatch::new();
            for (id, data) in chunk {
                batch.upsert(collection, id, data);
            }
            store.commit(batch).await
        },
        options,
    )
    .await
}
