use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{Direction, Document, FilterOp, Query, Store, StoreError, WriteBatch, WriteOp};

const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// In-process [`Store`] used by tests and local runs without Postgres.
/// Every operation takes the single lock, which gives the same atomicity
/// guarantees the Postgres backend gets from row locks and transactions.
pub struct MemoryStore {
    collections: Mutex<Collections>,
    max_batch_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_batch_size(DEFAULT_MAX_BATCH_SIZE)
    }

    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Number of documents currently held in `collection`.
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .await
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

type Collections = HashMap<String, BTreeMap<String, Document>>;

fn merge(target: &mut Document, data: Document) {
    for (key, value) in data {
        target.insert(key, value);
    }
}

fn apply_increment<F: AsRef<str>>(
    collections: &mut Collections,
    collection: &str,
    id: &str,
    deltas: &[(F, i64)],
) -> Result<(), StoreError> {
    let doc = collections
        .get_mut(collection)
        .and_then(|c| c.get_mut(id))
        .ok_or_else(|| StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;

    // Validate first so a bad field leaves the document untouched.
    for (field, _) in deltas {
        match doc.get(field.as_ref()) {
            None | Some(Value::Null) => {}
            Some(v) if v.as_i64().is_some() => {}
            Some(_) => return Err(StoreError::NotNumeric(field.as_ref().to_string())),
        }
    }
    for (field, delta) in deltas {
        let current = doc.get(field.as_ref()).and_then(Value::as_i64).unwrap_or(0);
        doc.insert(field.as_ref().to_string(), Value::from(current + delta));
    }
    Ok(())
}

/// Orders two JSON scalars the way a typed comparison would; values of
/// different kinds are incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn matches(doc: &Document, query: &Query) -> bool {
    query.filters.iter().all(|filter| {
        let field = doc.get(&filter.field).unwrap_or(&Value::Null);
        if filter.op == FilterOp::Eq {
            return field == &filter.value;
        }
        let Some(ordering) = compare(field, &filter.value) else {
            return false;
        };
        match filter.op {
            FilterOp::Lt => ordering.is_lt(),
            FilterOp::Lte => ordering.is_le(),
            FilterOp::Gt => ordering.is_gt(),
            FilterOp::Gte => ordering.is_ge(),
            FilterOp::Eq => ordering.is_eq(),
        }
    })
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.lock().await;
        Ok(collections.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn upsert(&self, collection: &str, id: &str, data: Document) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().await;
        let doc = collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        merge(doc, data);
        Ok(())
    }

    async fn increment(
        &self,
        collection: &str,
        id: &str,
        deltas: &[(&str, i64)],
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.lock().await;
        apply_increment(&mut collections, collection, id, deltas)
    }

    async fn append_bounded(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
        max_len: usize,
    ) -> Result<bool, StoreError> {
        let mut collections = self.collections.lock().await;
        let doc = collections
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        let entry = doc
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if entry.is_null() {
            *entry = Value::Array(Vec::new());
        }
        match entry {
            Value::Array(items) if items.len() < max_len => {
                items.push(value);
                Ok(true)
            }
            Value::Array(_) => Ok(false),
            _ => Err(StoreError::NotAnObject(format!("{field} is not an array"))),
        }
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.len() > self.max_batch_size {
            return Err(StoreError::BatchTooLarge {
                size: batch.len(),
                limit: self.max_batch_size,
            });
        }
        let mut collections = self.collections.lock().await;
        // Stage on a copy so a failing op leaves nothing behind.
        let mut staged = collections.clone();
        for op in batch.into_ops() {
            match op {
                WriteOp::Upsert {
                    collection,
                    id,
                    data,
                } => {
                    let doc = staged.entry(collection).or_default().entry(id).or_default();
                    merge(doc, data);
                }
                WriteOp::Increment {
                    collection,
                    id,
                    deltas,
                } => apply_increment(&mut staged, &collection, &id, &deltas)?,
            }
        }
        *collections = staged;
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.lock().await;
        let Some(collection) = collections.get(&query.collection) else {
            return Ok(Vec::new());
        };

        let mut docs: Vec<Document> = collection
            .values()
            .filter(|doc| matches(doc, query))
            .cloned()
            .collect();

        if let Some((field, direction)) = &query.order_by {
            docs.sort_by(|a, b| {
                let ordering = compare(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                )
                .unwrap_or(Ordering::Equal);
                match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}
