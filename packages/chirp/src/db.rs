use anyhow::{Context, Result};
use chirp_conduit::Payload;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use std::path::Path;
use tracing::info;

#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

/// A relayed payload as kept in the message store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub payload: Payload,
    pub created_at: i64,
}

impl Database {
    pub async fn open(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        info!("Connecting to message store: {}", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect(&url)
            .await
            .with_context(|| format!("Failed to connect to database: {}", url))?;

        run_migrations(&pool).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory store; every connection would otherwise get
    /// its own empty database.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn insert_message(&self, payload: &Payload) -> Result<i64> {
        let kind = if payload.is_text() { "text" } else { "binary" };
        let result = sqlx::query("INSERT INTO messages (kind, body, created_at) VALUES (?, ?, ?)")
            .bind(kind)
            .bind(payload.as_bytes())
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .context("Failed to store message")?;
        Ok(result.last_insert_rowid())
    }

    /// Every stored message, oldest first.
    pub async fn all_messages(&self) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query("SELECT id, kind, body, created_at FROM messages ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_message).collect()
    }

    /// The newest `limit` messages, oldest first.
    pub async fn recent_messages(&self, limit: i64) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, body, created_at FROM (
                SELECT id, kind, body, created_at FROM messages ORDER BY id DESC LIMIT ?
            ) ORDER BY id ASC
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    pub async fn message_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn is_reachable(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

fn row_to_message(row: &SqliteRow) -> Result<StoredMessage> {
    let kind: String = row.try_get("kind")?;
    let body: Vec<u8> = row.try_get("body")?;
    let payload = match kind.as_str() {
        "text" => Payload::Text(
            String::from_utf8(body).context("Stored text message is not valid UTF-8")?,
        ),
        _ => Payload::Binary(body),
    };
    Ok(StoredMessage {
        id: row.try_get("id")?,
        payload,
        created_at: row.try_get("created_at")?,
    })
}

/// Current schema version - increment when adding migrations
const SCHEMA_VERSION: i64 = 1;

pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "Database schema version {} is newer than supported version {}. Please upgrade the application.",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version == SCHEMA_VERSION {
        return Ok(());
    }

    if current_version < 1 {
        info!("Applying migration 1: messages table");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL CHECK (kind IN ('text', 'binary')),
                body BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("INSERT INTO schema_version (version, description) VALUES (1, 'messages table')")
            .execute(pool)
            .await?;
    }

    Ok(())
}
