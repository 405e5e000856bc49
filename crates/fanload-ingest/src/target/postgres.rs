//! PostgreSQL target over sqlx: COPY for rows, catalog queries for indexes

use async_trait::async_trait;
use fanload_common::{FanloadError, Result};
use futures::StreamExt;
use sqlx::{Connection, PgConnection};
use tracing::debug;

use super::{encode_copy_text, redact_url, RowBatchStream, TargetConnection, TargetStore};
use crate::job::{IndexDefinition, QualifiedName};
use crate::projector::quote_identifier;

const INDEX_QUERY: &str = r#"
    SELECT
        n.nspname,
        i.relname,
        pg_get_indexdef(i.oid),
        c.conname,
        pg_get_constraintdef(c.oid)
    FROM pg_index x
    JOIN pg_class i ON i.oid = x.indexrelid
    JOIN pg_class t ON t.oid = x.indrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    LEFT JOIN pg_constraint c
        ON c.conindid = x.indexrelid
       AND c.conrelid = t.oid
       AND c.contype IN ('p', 'u', 'x')
    WHERE t.relname = $1
      AND n.nspname = COALESCE($2, current_schema())
    ORDER BY i.relname
"#;

type IndexRow = (String, String, String, Option<String>, Option<String>);

/// Opens a fresh `PgConnection` per request
pub struct PgStore {
    url: String,
}

impl PgStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl TargetStore for PgStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> Result<Box<dyn TargetConnection>> {
        let conn = PgConnection::connect(&self.url).await.map_err(|e| {
            FanloadError::target(format!("failed to connect to {}: {}", redact_url(&self.url), e))
        })?;
        Ok(Box::new(PgTargetConnection { conn }))
    }
}

pub struct PgTargetConnection {
    conn: PgConnection,
}

#[async_trait]
impl TargetConnection for PgTargetConnection {
    async fn truncate(&mut self, table: &QualifiedName) -> Result<()> {
        let sql = format!("TRUNCATE {}", table.quoted());
        sqlx::query(&sql)
            .execute(&mut self.conn)
            .await
            .map_err(FanloadError::target)?;
        Ok(())
    }

    async fn drop_indexes(&mut self, table: &QualifiedName) -> Result<Vec<IndexDefinition>> {
        let rows: Vec<IndexRow> = sqlx::query_as(INDEX_QUERY)
            .bind(&table.table)
            .bind(table.schema.as_deref())
            .fetch_all(&mut self.conn)
            .await
            .map_err(FanloadError::target)?;

        let mut tx = self.conn.begin().await.map_err(FanloadError::target)?;
        let mut indexes = Vec::with_capacity(rows.len());

        for (schema, name, index_def, constraint, constraint_def) in rows {
            let (drop_sql, definition) = match (constraint, constraint_def) {
                (Some(constraint), Some(constraint_def)) => (
                    format!(
                        "ALTER TABLE {} DROP CONSTRAINT {}",
                        table.quoted(),
                        quote_identifier(&constraint)
                    ),
                    IndexDefinition::new(
                        &name,
                        format!(
                            "ALTER TABLE {} ADD CONSTRAINT {} {}",
                            table.quoted(),
                            quote_identifier(&constraint),
                            constraint_def
                        ),
                    )
                    .with_constraint(constraint),
                ),
                _ => (
                    format!(
                        "DROP INDEX {}.{}",
                        quote_identifier(&schema),
                        quote_identifier(&name)
                    ),
                    IndexDefinition::new(&name, index_def),
                ),
            };

            debug!(table = %table, index = %name, "Dropping index");
            sqlx::query(&drop_sql)
                .execute(&mut *tx)
                .await
                .map_err(FanloadError::target)?;
            indexes.push(definition);
        }

        tx.commit().await.map_err(FanloadError::target)?;
        Ok(indexes)
    }

    async fn recreate_indexes(
        &mut self,
        table: &QualifiedName,
        indexes: &[IndexDefinition],
    ) -> Result<()> {
        for index in indexes {
            debug!(table = %table, index = %index.name, "Recreating index");
            sqlx::query(&index.create_sql)
                .execute(&mut self.conn)
                .await
                .map_err(|e| FanloadError::target(format!("index {}: {}", index.name, e)))?;
        }
        Ok(())
    }

    async fn bulk_write(
        &mut self,
        table: &QualifiedName,
        columns: &[String],
        mut rows: RowBatchStream,
    ) -> Result<u64> {
        let statement = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
            table.quoted(),
            columns.join(", ")
        );
        let mut copy = self
            .conn
            .copy_in_raw(&statement)
            .await
            .map_err(FanloadError::target)?;

        let mut buf = String::new();
        while let Some(batch) = rows.next().await {
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    let _ = copy.abort(e.to_string()).await;
                    return Err(e);
                }
            };
            buf.clear();
            for row in &batch {
                encode_copy_text(row, &mut buf);
            }
            let sent = copy.send(buf.as_bytes()).await.map(|_| ());
            if let Err(e) = sent {
                let _ = copy.abort(e.to_string()).await;
                return Err(FanloadError::target(e));
            }
        }

        copy.finish().await.map_err(FanloadError::target)
    }
}
