use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use facia_core::{Embedding, EnrolledEmbedding, Identity, IdentityStore, StoreError};
use rusqlite::{params, Connection};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id              TEXT PRIMARY KEY,
    label           TEXT NOT NULL,
    enrolled_at     TEXT NOT NULL,
    encoder_version TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS embeddings (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id     TEXT NOT NULL REFERENCES identities(id),
    vector          TEXT NOT NULL,
    encoder_version TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS access_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT,
    operation   TEXT NOT NULL,
    result      TEXT NOT NULL,
    score       REAL,
    timestamp   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_identity ON embeddings(identity_id);
";

/// One access-log row: an identify or verify attempt and how it ended.
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub identity_id: Option<String>,
    pub operation: String,
    pub result: String,
    pub score: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

/// SQLite-backed identity store. Descriptor vectors are stored as JSON
/// arrays; all timestamps are RFC 3339 UTC strings.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn query_err(e: rusqlite::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt { id: id.to_string(), reason: format!("bad timestamp: {e}") })
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories
    /// as needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "opened identity store");
        Self::init(conn)
    }

    /// Purely in-memory store, for tests and diagnostics.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(query_err)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All enrolled identities, oldest first.
    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, label, enrolled_at, encoder_version FROM identities ORDER BY enrolled_at",
            )
            .map_err(query_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(query_err)?;

        let mut identities = Vec::new();
        for row in rows {
            let (id, label, enrolled_at, encoder_version) = row.map_err(query_err)?;
            let enrolled_at = parse_timestamp(&id, &enrolled_at)?;
            identities.push(Identity { id, label, enrolled_at, encoder_version });
        }
        Ok(identities)
    }

    /// Append one row to the access log.
    pub fn record_access(
        &self,
        identity_id: Option<&str>,
        operation: &str,
        result: &str,
        score: Option<f32>,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO access_log (identity_id, operation, result, score, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![identity_id, operation, result, score, Utc::now().to_rfc3339()],
        )
        .map_err(query_err)?;
        Ok(())
    }

    /// Most recent access-log rows, newest first.
    pub fn recent_access(&self, limit: usize) -> Result<Vec<AccessRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, identity_id, operation, result, score, timestamp
                 FROM access_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(query_err)?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<f32>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(query_err)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, identity_id, operation, result, score, timestamp) = row.map_err(query_err)?;
            let timestamp = parse_timestamp(&id.to_string(), &timestamp)?;
            records.push(AccessRecord { identity_id, operation, result, score, timestamp });
        }
        Ok(records)
    }
}

impl IdentityStore for SqliteStore {
    fn load_all_embeddings(&self) -> Result<Vec<EnrolledEmbedding>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT id, identity_id, vector, encoder_version FROM embeddings")
            .map_err(query_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(query_err)?;

        let mut embeddings = Vec::new();
        for row in rows {
            let (row_id, identity_id, vector, version) = row.map_err(query_err)?;
            let values: Vec<f32> = serde_json::from_str(&vector).map_err(|e| {
                StoreError::Corrupt { id: row_id.to_string(), reason: format!("bad vector: {e}") }
            })?;
            embeddings.push(EnrolledEmbedding {
                identity_id,
                embedding: Embedding::new(values, version),
            });
        }

        tracing::debug!(count = embeddings.len(), "loaded embeddings from store");
        Ok(embeddings)
    }

    fn persist_enrollment(
        &self,
        identity: &Identity,
        embeddings: &[Embedding],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(query_err)?;

        tx.execute(
            "INSERT INTO identities (id, label, enrolled_at, encoder_version)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                identity.id,
                identity.label,
                identity.enrolled_at.to_rfc3339(),
                identity.encoder_version
            ],
        )
        .map_err(query_err)?;

        for embedding in embeddings {
            let vector = serde_json::to_string(&embedding.values)
                .map_err(|e| StoreError::Query(format!("vector serialization: {e}")))?;
            tx.execute(
                "INSERT INTO embeddings (identity_id, vector, encoder_version)
                 VALUES (?1, ?2, ?3)",
                params![identity.id, vector, embedding.version],
            )
            .map_err(query_err)?;
        }

        tx.commit().map_err(query_err)?;
        tracing::info!(
            identity = %identity.id,
            label = %identity.label,
            samples = embeddings.len(),
            "persisted enrollment"
        );
        Ok(())
    }

    fn delete_identity(&self, identity_id: &str) -> Result<(), StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(query_err)?;
        tx.execute("DELETE FROM embeddings WHERE identity_id = ?1", params![identity_id])
            .map_err(query_err)?;
        let removed = tx
            .execute("DELETE FROM identities WHERE id = ?1", params![identity_id])
            .map_err(query_err)?;
        tx.commit().map_err(query_err)?;
        tracing::info!(identity = identity_id, removed, "deleted identity");
        Ok(())
    }
}
