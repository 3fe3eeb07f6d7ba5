use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};

use super::{Direction, Document, Query, Store, StoreError, WriteBatch, WriteOp};

/// Postgres-backed [`Store`]. Every collection lives in the `documents`
/// table as `(collection, id, data jsonb)`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    max_batch_size: usize,
}

impl PgStore {
    pub fn new(pool: PgPool, max_batch_size: usize) -> Self {
        Self {
            pool,
            max_batch_size: max_batch_size.max(1),
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let row: Option<(Json<Document>,)> =
            sqlx::query_as("SELECT data FROM documents WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(data,)| data.0))
    }

    async fn upsert(&self, collection: &str, id: &str, data: Document) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3)
             ON CONFLICT (collection, id)
             DO UPDATE SET data = documents.data || EXCLUDED.data, updated_at = NOW()",
        )
        .bind(collection)
        .bind(id)
        .bind(Json(&data))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment(
        &self,
        collection: &str,
        id: &str,
        deltas: &[(&str, i64)],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        increment_fields(&mut *tx, collection, id, deltas).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_bounded(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
        max_len: usize,
    ) -> Result<bool, StoreError> {
        let appended = sqlx::query(
            "UPDATE documents
             SET data = jsonb_set(
                     data,
                     ARRAY[$3::text],
                     COALESCE(NULLIF(data -> $3::text, 'null'::jsonb), '[]'::jsonb) || jsonb_build_array($4::jsonb)
                 ),
                 updated_at = NOW()
             WHERE collection = $1 AND id = $2
               AND jsonb_array_length(COALESCE(NULLIF(data -> $3::text, 'null'::jsonb), '[]'::jsonb)) < $5",
        )
        .bind(collection)
        .bind(id)
        .bind(field)
        .bind(Json(&value))
        .bind(max_len as i64)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if !appended && self.get(collection, id).await?.is_none() {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(appended)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.len() > self.max_batch_size {
            return Err(StoreError::BatchTooLarge {
                size: batch.len(),
                limit: self.max_batch_size,
            });
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for op in batch.into_ops() {
            match op {
                WriteOp::Upsert {
                    collection,
                    id,
                    data,
                } => {
                    sqlx::query(
                        "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3)
                         ON CONFLICT (collection, id)
                         DO UPDATE SET data = documents.data || EXCLUDED.data, updated_at = NOW()",
                    )
                    .bind(&collection)
                    .bind(&id)
                    .bind(Json(&data))
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::Increment {
                    collection,
                    id,
                    deltas,
                } => increment_fields(&mut *tx, &collection, &id, &deltas).await?,
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT data FROM documents WHERE collection = ");
        builder.push_bind(query.collection.clone());

        for filter in &query.filters {
            builder.push(" AND data -> ");
            builder.push_bind(filter.field.clone());
            builder.push(format!(" {} ", filter.op.sql()));
            builder.push_bind(Json(filter.value.clone()));
        }

        if let Some((field, direction)) = &query.order_by {
            builder.push(" ORDER BY data -> ");
            builder.push_bind(field.clone());
            builder.push(match direction {
                Direction::Asc => " ASC",
                Direction::Desc => " DESC",
            });
        }

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows: Vec<(Json<Document>,)> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(data,)| data.0).collect())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}

/// Add each delta to its numeric field inside an open transaction.
async fn increment_fields<F: AsRef<str>>(
    conn: &mut PgConnection,
    collection: &str,
    id: &str,
    deltas: &[(F, i64)],
) -> Result<(), StoreError> {
    for (field, delta) in deltas {
        let field = field.as_ref();
        let result = sqlx::query(
            "UPDATE documents
             SET data = jsonb_set(
                     data,
                     ARRAY[$3::text],
                     to_jsonb(COALESCE((data ->> $3::text)::bigint, 0) + $4::bigint)
                 ),
                 updated_at = NOW()
             WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .bind(field)
        .bind(*delta)
        .execute(&mut *conn)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                return Err(StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            Ok(_) => {}
            // 22P02: invalid_text_representation, the field held a non-integer
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("22P02") => {
                return Err(StoreError::NotNumeric(field.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
