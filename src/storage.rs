use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous}};
use tokio::sync::Mutex;

use crate::message::ChatMessage;
use crate::settings::ChatSettings;

pub const STORE_KEY: &str = "mgdi-chat-store";
pub const SNAPSHOT_VERSION: i64 = 0;

/// The part of the conversation state that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PersistedState {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub settings: ChatSettings,
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Option<PersistedState>>;
    async fn save(&self, key: &str, state: &PersistedState) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;
}

#[derive(Clone)]
pub struct SqliteSnapshotRepository {
    pool: Pool<Sqlite>,
}

impl SqliteSnapshotRepository {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(%url, "snapshot database ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    default_db_url_from(|name| std::env::var(name).ok())
}

/// `MGDI_DATABASE_URL` wins; otherwise the database lives under the XDG data
/// directory, falling back to `~/.local/share`.
fn default_db_url_from(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<String> {
    if let Some(url) = env("MGDI_DATABASE_URL").filter(|u| !u.is_empty()) {
        return Ok(url);
    }
    let data_home = match env("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(env("HOME").unwrap_or_else(|| ".".into())).join(".local/share"),
    };
    let dir = data_home.join("mgdi_chat");
    std::fs::create_dir_all(&dir)?;
    Ok(format!("sqlite://{}", dir.join("chat.db").display()))
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn load(&self, key: &str) -> anyhow::Result<Option<PersistedState>> {
        let row = sqlx::query("SELECT version, payload FROM snapshots WHERE name = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let version: i64 = r.get("version");
        if version != SNAPSHOT_VERSION {
            anyhow::bail!("snapshot '{}' has unsupported version {}", key, version);
        }
        let payload: String = r.get("payload");
        Ok(Some(serde_json::from_str(&payload)?))
    }

    async fn save(&self, key: &str, state: &PersistedState) -> anyhow::Result<()> {
        let payload = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT INTO snapshots (name, version, payload, updated_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(name) DO UPDATE SET version = excluded.version, payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(SNAPSHOT_VERSION)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM snapshots WHERE name = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}

/// Keeps snapshots as serialized JSON in memory; nothing outlives the process.
#[derive(Default)]
pub struct MemorySnapshotRepository {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySnapshotRepository {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl SnapshotRepository for MemorySnapshotRepository {
    async fn load(&self, key: &str) -> anyhow::Result<Option<PersistedState>> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(payload) => Ok(Some(serde_json::from_str(payload)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, key: &str, state: &PersistedState) -> anyhow::Result<()> {
        let payload = serde_json::to_string(state)?;
        self.entries.lock().await.insert(key.to_string(), payload);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }
}
