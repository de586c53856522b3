use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

use shared::domain::{ConversationId, ConversationKind};

/// Names one persisted snapshot: a conversation list or a single timeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    ConversationList(ConversationKind),
    Timeline(ConversationKind, ConversationId),
}

impl CacheKey {
    pub fn timeline(kind: ConversationKind, conversation_id: &ConversationId) -> Self {
        CacheKey::Timeline(kind, conversation_id.clone())
    }

    /// Stable string key used as the row identifier.
    pub fn storage_key(&self) -> String {
        match self {
            CacheKey::ConversationList(ConversationKind::Direct) => "dialogs_cache".to_string(),
            CacheKey::ConversationList(ConversationKind::Group) => "groups_cache".to_string(),
            CacheKey::Timeline(ConversationKind::Direct, id) => format!("messages_{id}"),
            CacheKey::Timeline(ConversationKind::Group, id) => format!("group_messages_{id}"),
        }
    }
}

/// Durable key-value store for serialized snapshots. No eviction.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn save(&self, key: &CacheKey, snapshot: &str) -> Result<()>;
    async fn load(&self, key: &CacheKey) -> Result<Option<String>>;
    async fn clear(&self) -> Result<()>;
}

pub async fn save_snapshot<T>(cache: &dyn CacheStore, key: &CacheKey, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let snapshot = serde_json::to_string(value)
        .with_context(|| format!("failed to encode snapshot '{}'", key.storage_key()))?;
    cache.save(key, &snapshot).await
}

pub async fn load_snapshot<T>(cache: &dyn CacheStore, key: &CacheKey) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    let Some(snapshot) = cache.load(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_str(&snapshot)
        .with_context(|| format!("failed to decode snapshot '{}'", key.storage_key()))?;
    Ok(Some(value))
}

/// SQLite-backed cache.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);

        // Every connection to an in-memory database sees its own schema, so
        // the pool is pinned to a single long-lived connection.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open cache database '{database_url}'"))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run cache migrations")?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("cache database health check failed")?;
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT cache_key FROM cache_entries ORDER BY cache_key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get("cache_key")).collect())
    }
}

#[async_trait]
impl CacheStore for Storage {
    async fn save(&self, key: &CacheKey, snapshot: &str) -> Result<()> {
        let storage_key = key.storage_key();
        sqlx::query(
            "INSERT INTO cache_entries (cache_key, snapshot, updated_at)
             VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(cache_key) DO UPDATE SET
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at",
        )
        .bind(&storage_key)
        .bind(snapshot)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save cache entry '{storage_key}'"))?;
        tracing::debug!(cache_key = %storage_key, bytes = snapshot.len(), "cache entry saved");
        Ok(())
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<String>> {
        let storage_key = key.storage_key();
        let row = sqlx::query("SELECT snapshot FROM cache_entries WHERE cache_key = ?")
            .bind(&storage_key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load cache entry '{storage_key}'"))?;
        Ok(row.map(|row| row.get("snapshot")))
    }

    async fn clear(&self) -> Result<()> {
        let removed = sqlx::query("DELETE FROM cache_entries")
            .execute(&self.pool)
            .await
            .context("failed to clear cache entries")?
            .rows_affected();
        tracing::info!(removed, "cache cleared");
        Ok(())
    }
}

/// Process-local cache for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().contains_key(&key.storage_key())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn save(&self, key: &CacheKey, snapshot: &str) -> Result<()> {
        self.lock().insert(key.storage_key(), snapshot.to_string());
        Ok(())
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<String>> {
        Ok(self.lock().get(&key.storage_key()).cloned())
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for cache url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
