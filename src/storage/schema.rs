use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{is_lock_error, DatabaseError};

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database lock, `DatabaseError::Migration` if the schema could not be
    /// created, and `DatabaseError::Other` for anything else.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-004: Feature payloads may be sensitive; create the file owner-only
        // before the pool opens it.
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "SEC-004: Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // SQLite reports the real error at connect time.
                }
            }
        }

        // busy_timeout and foreign_keys are per connection, so set them on the
        // options every pooled connection is built from.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            if is_lock_error(&e.to_string()) {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        tracing::debug!(path = %path, "Database ready");
        Ok(db)
    }

    /// Creates the schema inside one transaction.
    ///
    /// Every statement is `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Folders form a tree; deleting a parent lifts its children to the root.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                order_key TEXT NOT NULL,
                parent_id TEXT REFERENCES folders(id) ON DELETE SET NULL,
                visible INTEGER NOT NULL DEFAULT 1,
                locked INTEGER NOT NULL DEFAULT 0,
                expanded INTEGER NOT NULL DEFAULT 1,
                sync_key TEXT UNIQUE
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS features (
                id TEXT PRIMARY KEY,
                folder_id TEXT NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
                order_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                UNIQUE(folder_id, order_key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Sibling folders never share an order key. NULLs are distinct in a
        // UNIQUE index, so root folders need their own partial index.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_folders_order ON folders(parent_id, order_key)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_folders_root_order ON folders(order_key) WHERE parent_id IS NULL",
        )
        .execute(&mut *tx)
        .await?;

        // One row per applied transaction.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_log (
                id INTEGER PRIMARY KEY,
                note TEXT NOT NULL,
                applied_at INTEGER NOT NULL,
                folders_put INTEGER NOT NULL,
                features_put INTEGER NOT NULL,
                features_deleted INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_creates_schema() {
        let db = Database::open(":memory:").await.unwrap();
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&db.pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert_eq!(names, vec!["change_log", "features", "folders"]);
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn test_sibling_folders_cannot_share_order_key() {
        let db = Database::open(":memory:").await.unwrap();
        let insert = |id: &'static str, parent: Option<&'static str>| {
            sqlx::query("INSERT INTO folders (id, name, order_key, parent_id) VALUES (?, ?, 'a0', ?)")
                .bind(id)
                .bind(id)
                .bind(parent)
        };

        insert("root-1", None).execute(&db.pool).await.unwrap();
        let dup_root = insert("root-2", None).execute(&db.pool).await;
        assert!(dup_root.is_err(), "two root folders keyed a0");

        // Same key is fine one level down, but not twice under one parent.
        insert("child-1", Some("root-1")).execute(&db.pool).await.unwrap();
        let dup_child = insert("child-2", Some("root-1")).execute(&db.pool).await;
        assert!(dup_child.is_err(), "two children of root-1 keyed a0");
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let db = Database::open(":memory:").await.unwrap();
        let (on,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(on, 1);
    }
}
