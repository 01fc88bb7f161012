//! PostgreSQL backing store

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use crate::backend::{PropertyBackend, PropertyRow};
use crate::error::{BackendError, BackendResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    key VARCHAR(256) PRIMARY KEY,
    value TEXT NOT NULL DEFAULT '',
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

const UPSERT: &str = "INSERT INTO properties (key, value, updated_at) VALUES ($1, $2, NOW()) \
                      ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()";

/// Turns a raw prefix into a LIKE pattern, escaping the wildcard characters
/// so user keys cannot widen the match.
fn like_prefix(prefix: &str) -> String {
  let mut pattern = String::with_capacity(prefix.len() + 1);
  for c in prefix.chars() {
    if matches!(c, '%' | '_' | '\\') {
      pattern.push('\\');
    }
    pattern.push(c);
  }
  pattern.push('%');
  pattern
}

/// Property store backed by a PostgreSQL `properties` table.
pub struct PostgresBackend {
  pool: Pool,
}

impl PostgresBackend {
  pub fn new(url: &str) -> Result<Self, BackendError> {
    let mut cfg = Config::new();
    cfg.url = Some(url.into());
    cfg.manager = Some(ManagerConfig {
      recycling_method: RecyclingMethod::Fast,
    });
    let pool = cfg
      .create_pool(Some(Runtime::Tokio1), NoTls)
      .map_err(|e| BackendError::Unavailable(e.to_string()))?;
    Ok(Self { pool })
  }

  pub fn with_pool(pool: Pool) -> Self {
    Self { pool }
  }

  /// Creates the `properties` table if it does not exist.
  pub async fn init_schema(&self) -> BackendResult<()> {
    self.pool.get().await?.batch_execute(SCHEMA).await?;
    tracing::info!("properties schema initialized");
    Ok(())
  }
}

#[async_trait]
impl PropertyBackend for PostgresBackend {
  async fn read_one(&self, key: &str) -> BackendResult<Option<String>> {
    let client = self.pool.get().await?;
    let row = client
      .query_opt("SELECT value FROM properties WHERE key = $1", &[&key])
      .await?;
    Ok(row.map(|r| r.get(0)))
  }

  async fn read_prefix(&self, prefix: &str) -> BackendResult<Vec<PropertyRow>> {
    let client = self.pool.get().await?;
    let rows = client
      .query(
        "SELECT key, value FROM properties WHERE key LIKE $1 ESCAPE '\\'",
        &[&like_prefix(prefix)],
      )
      .await?;
    Ok(
      rows
        .into_iter()
        .map(|r| PropertyRow::new(r.get::<_, String>(0), r.get::<_, String>(1)))
        .collect(),
    )
  }

  async fn upsert_batch(&self, rows: &[PropertyRow]) -> BackendResult<Vec<bool>> {
    // One pooled connection per batch; per-row failures are isolated so a
    // single bad record cannot abort the rest.
    let client = self.pool.get().await?;
    let statement = client.prepare(UPSERT).await?;

    let mut outcomes = Vec::with_capacity(rows.len());
    for row in rows {
      match client.execute(&statement, &[&row.key, &row.value]).await {
        Ok(_) => outcomes.push(true),
        Err(err) => {
          tracing::error!(key = %row.key, error = %err, "property upsert failed");
          outcomes.push(false);
        }
      }
    }
    Ok(outcomes)
  }

  async fn delete(&self, key: &str, is_prefix: bool) -> BackendResult<()> {
    let client = self.pool.get().await?;
    if is_prefix {
      client
        .execute(
          "DELETE FROM properties WHERE key LIKE $1 ESCAPE '\\'",
          &[&like_prefix(key)],
        )
        .await?;
    } else {
      client
        .execute("DELETE FROM properties WHERE key = $1", &[&key])
        .await?;
    }
    Ok(())
  }
}
