//! Database migration management.

use rusqlite::{params, Connection};

/// Applies schema migrations sequentially.
pub struct MigrationManager;

impl MigrationManager {
    /// Apply all pending migrations to the database.
    pub fn migrate(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        let current_version = Self::current_version(conn)?.unwrap_or(0);

        if current_version < 1 {
            Self::apply_migration_1(conn)?;
        }

        Ok(())
    }

    fn apply_migration_1(conn: &Connection) -> crate::Result<()> {
        conn.execute_batch(
            r#"
            -- SSH hosts a remote workspace runs on
            CREATE TABLE IF NOT EXISTS remotes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                ssh_port INTEGER NOT NULL DEFAULT 22,
                user_name TEXT NOT NULL,
                auth TEXT NOT NULL,
                secret TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                UNIQUE(address, ssh_port, user_name)
            );

            -- Kubernetes clusters a k8s workspace runs on
            CREATE TABLE IF NOT EXISTS clusters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                context TEXT NOT NULL,
                namespace TEXT,
                kubeconfig_path TEXT,
                kubeconfig_content TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );

            -- One row per workspace; config and manifest text travel with it
            CREATE TABLE IF NOT EXISTS workspaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                mode TEXT NOT NULL,
                working_dir TEXT,
                git_url TEXT,
                branch TEXT,
                git_auth TEXT NOT NULL DEFAULT 'public',
                git_username TEXT,
                git_secret TEXT,
                config_path TEXT,
                config_content TEXT,
                link_compose_content TEXT,
                manifest_content TEXT,
                extend TEXT,
                remote_id INTEGER REFERENCES remotes(id) ON DELETE SET NULL,
                cluster_id INTEGER REFERENCES clusters(id) ON DELETE SET NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );

            CREATE INDEX IF NOT EXISTS idx_workspaces_key
                ON workspaces(mode, working_dir, git_url, branch, config_path);

            INSERT OR REPLACE INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Get the current schema version.
    pub fn current_version(conn: &Connection) -> crate::Result<Option<u32>> {
        let mut stmt = conn.prepare("SELECT MAX(version) FROM schema_migrations")?;
        let version: Option<u32> = stmt.query_row(params![], |row| row.get(0)).ok().flatten();
        Ok(version)
    }
}
