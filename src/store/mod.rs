//! Storage port.
//!
//! The queue logic depends on four primitives only: keyed upsert-with-merge,
//! atomic numeric increment, bounded multi-item write batches (which may mix
//! upserts and increments), and simple
//! equality/range/ordered/limited queries. Documents are flat JSON objects
//! grouped by collection, so the same port can sit over Postgres (jsonb rows)
//! or an in-process map.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A stored document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Expected a JSON object, got: {0}")]
    NotAnObject(String),

    #[error("Document {collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("Write batch of {size} items exceeds the store limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("Field '{0}' is not numeric")]
    NotNumeric(String),
}

/// One keyed write inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert or shallow-merge `data`.
    Upsert {
        collection: String,
        id: String,
        data: Document,
    },
    /// Add each delta to its numeric field. The document must exist.
    Increment {
        collection: String,
        id: String,
        deltas: Vec<(String, i64)>,
    },
}

/// A group of writes committed atomically: either every op lands or none does.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, collection: &str, id: impl Into<String>, data: Document) {
        self.ops.push(WriteOp::Upsert {
            collection: collection.to_string(),
            id: id.into(),
            data,
        });
    }

    pub fn increment(&mut self, collection: &str, id: impl Into<String>, deltas: &[(&str, i64)]) {
        self.ops.push(WriteOp::Increment {
            collection: collection.to_string(),
            id: id.into(),
            deltas: deltas
                .iter()
                .map(|(field, delta)| ((*field).to_string(), *delta))
                .collect(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// A simple collection query. Filters are ANDed together.
#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Load a single document by key.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Insert or shallow-merge a document: fields present in `data` overwrite,
    /// fields absent from `data` are left untouched.
    async fn upsert(&self, collection: &str, id: &str, data: Document) -> Result<(), StoreError>;

    /// Atomically add each delta to its numeric field (missing fields count as 0).
    /// Fails with `NotFound` if the document does not exist.
    async fn increment(
        &self,
        collection: &str,
        id: &str,
        deltas: &[(&str, i64)],
    ) -> Result<(), StoreError>;

    /// Atomically append `value` to the array at `field` unless it already holds
    /// `max_len` entries. Returns whether the value was appended.
    async fn append_bounded(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
        max_len: usize,
    ) -> Result<bool, StoreError>;

    /// Commit every op in `batch` atomically.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Largest number of ops a single [`WriteBatch`] may carry.
    fn max_batch_size(&self) -> usize;
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::NotAnObject(other.to_string())),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

pub async fn get_as<T: DeserializeOwned>(
    store: &dyn Store,
    collection: &str,
    id: &str,
) -> Result<Option<T>, StoreError> {
    store.get(collection, id).await?.map(from_document).transpose()
}

pub async fn query_as<T: DeserializeOwned>(
    store: &dyn Store,
    query: &Query,
) -> Result<Vec<T>, StoreError> {
    store
        .query(query)
        .await?
        .into_iter()
        .map(from_document)
        .collect()
}
