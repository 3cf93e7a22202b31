//! Registry row types and persistence operations.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::secret::SecretCipher;

/// Raw row of the `workspaces` table. Secret fields are plaintext in memory
/// and sealed at the SQL boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: i64,
    pub name: String,
    pub mode: String,
    pub working_dir: Option<String>,
    pub git_url: Option<String>,
    pub branch: Option<String>,
    pub git_auth: String,
    pub git_username: Option<String>,
    pub git_secret: Option<String>,
    pub config_path: Option<String>,
    pub config_content: Option<String>,
    pub link_compose_content: Option<String>,
    pub manifest_content: Option<String>,
    pub extend: Option<String>,
    pub remote_id: Option<i64>,
    pub cluster_id: Option<i64>,
    pub deleted: bool,
    pub created_at: String,
}

/// Raw row of the `remotes` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: i64,
    pub address: String,
    pub ssh_port: u16,
    pub user_name: String,
    pub auth: String,
    pub secret: Option<String>,
    pub created_at: String,
}

/// Raw row of the `clusters` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: i64,
    pub context: String,
    pub namespace: Option<String>,
    pub kubeconfig_path: Option<String>,
    pub kubeconfig_content: Option<String>,
    pub created_at: String,
}

/// Natural key of a workspace, independent of its row id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceKey {
    pub mode: String,
    pub working_dir: Option<String>,
    pub git_url: Option<String>,
    pub branch: Option<String>,
    pub config_path: Option<String>,
    pub remote_id: Option<i64>,
    pub cluster_id: Option<i64>,
}

const WORKSPACE_COLUMNS: &str = "id, name, mode, working_dir, git_url, branch, git_auth, \
     git_username, git_secret, config_path, config_content, link_compose_content, \
     manifest_content, extend, remote_id, cluster_id, deleted, created_at";

/// Persistence operations for workspaces.
pub struct WorkspaceStore<'a> {
    conn: &'a Connection,
    cipher: &'a SecretCipher,
}

impl<'a> WorkspaceStore<'a> {
    pub fn new(conn: &'a Connection, cipher: &'a SecretCipher) -> Self {
        Self { conn, cipher }
    }

    fn validate(record: &WorkspaceRecord) -> crate::Result<()> {
        match record.mode.as_str() {
            "local" | "remote" | "k8s" => {}
            other => {
                return Err(crate::Error::validation(format!(
                    "unknown workspace mode {:?}",
                    other
                )))
            }
        }
        if record.mode == "remote" && record.remote_id.is_none() {
            return Err(crate::Error::validation(
                "remote workspace has no remote host row",
            ));
        }
        if record.mode == "k8s" && record.cluster_id.is_none() {
            return Err(crate::Error::validation(
                "k8s workspace has no cluster row",
            ));
        }
        if record.mode != "k8s" {
            if record.config_content.as_deref().unwrap_or("").trim().is_empty() {
                return Err(crate::Error::validation("workspace config content is empty"));
            }
            if record.manifest_content.as_deref().unwrap_or("").trim().is_empty() {
                return Err(crate::Error::validation(
                    "workspace runtime manifest is empty",
                ));
            }
        }
        Ok(())
    }

    pub fn insert(&self, record: &WorkspaceRecord) -> crate::Result<i64> {
        Self::validate(record)?;
        let sealed = self.cipher.seal_opt(record.git_secret.as_deref())?;
        self.conn.execute(
            r#"
            INSERT INTO workspaces (name, mode, working_dir, git_url, branch, git_auth,
                git_username, git_secret, config_path, config_content,
                link_compose_content, manifest_content, extend, remote_id, cluster_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                record.name,
                record.mode,
                record.working_dir,
                record.git_url,
                record.branch,
                record.git_auth,
                record.git_username,
                sealed,
                record.config_path,
                record.config_content,
                record.link_compose_content,
                record.manifest_content,
                record.extend,
                record.remote_id,
                record.cluster_id,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update(&self, record: &WorkspaceRecord) -> crate::Result<()> {
        Self::validate(record)?;
        let sealed = self.cipher.seal_opt(record.git_secret.as_deref())?;
        let affected = self.conn.execute(
            r#"
            UPDATE workspaces
            SET name = ?, mode = ?, working_dir = ?, git_url = ?, branch = ?, git_auth = ?,
                git_username = ?, git_secret = ?, config_path = ?, config_content = ?,
                link_compose_content = ?, manifest_content = ?, extend = ?,
                remote_id = ?, cluster_id = ?
            WHERE id = ? AND deleted = 0
            "#,
            params![
                record.name,
                record.mode,
                record.working_dir,
                record.git_url,
                record.branch,
                record.git_auth,
                record.git_username,
                sealed,
                record.config_path,
                record.config_content,
                record.link_compose_content,
                record.manifest_content,
                record.extend,
                record.remote_id,
                record.cluster_id,
                record.id,
            ],
        )?;
        if affected == 0 {
            return Err(crate::Error::not_found(format!("workspace {}", record.id)));
        }
        if affected > 1 {
            return Err(crate::Error::conflict(format!(
                "workspace update touched {} rows",
                affected
            )));
        }
        Ok(())
    }

    /// Update only the serialized extend column (state and port bindings).
    pub fn update_extend(&self, id: i64, extend: &str) -> crate::Result<()> {
        let affected = self.conn.execute(
            "UPDATE workspaces SET extend = ? WHERE id = ? AND deleted = 0",
            params![extend, id],
        )?;
        if affected != 1 {
            return Err(crate::Error::not_found(format!("workspace {}", id)));
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> crate::Result<Option<WorkspaceRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM workspaces WHERE id = ? AND deleted = 0",
            WORKSPACE_COLUMNS
        ))?;
        let record = stmt
            .query_row(params![id], |row| Self::map_row(row))
            .optional()?;
        record.map(|r| self.unseal(r)).transpose()
    }

    /// Secondary lookup by the natural key. Empty / absent key fields are
    /// not constrained (a remote workspace's working dir may be unknown
    /// until the host is reached).
    pub fn find_by_key(&self, key: &WorkspaceKey) -> crate::Result<Option<WorkspaceRecord>> {
        let mut sql = format!(
            "SELECT {} FROM workspaces WHERE deleted = 0 AND mode = ?",
            WORKSPACE_COLUMNS
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(key.mode.clone())];

        let mut push = |sql: &mut String, clause: &str, value: Box<dyn rusqlite::ToSql>| {
            sql.push_str(clause);
            args.push(value);
        };
        if let Some(dir) = key.working_dir.as_ref().filter(|d| !d.is_empty()) {
            push(&mut sql, " AND working_dir = ?", Box::new(dir.clone()));
        }
        if let Some(url) = key.git_url.as_ref().filter(|u| !u.is_empty()) {
            push(&mut sql, " AND git_url = ?", Box::new(url.clone()));
        }
        if let Some(branch) = key.branch.as_ref().filter(|b| !b.is_empty()) {
            push(&mut sql, " AND branch = ?", Box::new(branch.clone()));
        }
        if let Some(path) = key.config_path.as_ref().filter(|p| !p.is_empty()) {
            push(&mut sql, " AND config_path = ?", Box::new(path.clone()));
        }
        if let Some(remote_id) = key.remote_id {
            push(&mut sql, " AND remote_id = ?", Box::new(remote_id));
        }
        if let Some(cluster_id) = key.cluster_id {
            push(&mut sql, " AND cluster_id = ?", Box::new(cluster_id));
        }
        sql.push_str(" ORDER BY id LIMIT 1");

        let mut stmt = self.conn.prepare(&sql)?;
        let record = stmt
            .query_row(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
                Self::map_row(row)
            })
            .optional()?;
        record.map(|r| self.unseal(r)).transpose()
    }

    pub fn list(&self) -> crate::Result<Vec<WorkspaceRecord>> {
        self.list_where("deleted = 0")
    }

    pub fn list_deleted(&self) -> crate::Result<Vec<WorkspaceRecord>> {
        self.list_where("deleted = 1")
    }

    fn list_where(&self, filter: &str) -> crate::Result<Vec<WorkspaceRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM workspaces WHERE {} ORDER BY created_at DESC",
            WORKSPACE_COLUMNS, filter
        ))?;
        let rows = stmt.query_map(params![], |row| Self::map_row(row))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(self.unseal(row?)?);
        }
        Ok(records)
    }

    /// Soft-delete one workspace. The affected row count must be exactly
    /// one; anything else indicates a registry inconsistency.
    pub fn soft_delete(&self, id: i64) -> crate::Result<()> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM workspaces WHERE id = ? AND deleted = 0",
            params![id],
            |row| row.get(0),
        )?;
        if count == 0 {
            return Err(crate::Error::not_found(format!("workspace {}", id)));
        }
        if count > 1 {
            return Err(crate::Error::conflict(format!(
                "{} live rows share workspace id {}",
                count, id
            )));
        }

        let affected = self.conn.execute(
            "UPDATE workspaces SET deleted = 1 WHERE id = ? AND deleted = 0",
            params![id],
        )?;
        if affected != 1 {
            return Err(crate::Error::conflict(format!(
                "soft delete touched {} rows",
                affected
            )));
        }
        Ok(())
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<WorkspaceRecord> {
        Ok(WorkspaceRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            mode: row.get(2)?,
            working_dir: row.get(3)?,
            git_url: row.get(4)?,
            branch: row.get(5)?,
            git_auth: row.get(6)?,
            git_username: row.get(7)?,
            git_secret: row.get(8)?,
            config_path: row.get(9)?,
            config_content: row.get(10)?,
            link_compose_content: row.get(11)?,
            manifest_content: row.get(12)?,
            extend: row.get(13)?,
            remote_id: row.get(14)?,
            cluster_id: row.get(15)?,
            deleted: row.get(16)?,
            created_at: row.get(17)?,
        })
    }

    fn unseal(&self, mut record: WorkspaceRecord) -> crate::Result<WorkspaceRecord> {
        record.git_secret = self.cipher.open_opt(record.git_secret.as_deref())?;
        Ok(record)
    }
}

/// Persistence operations for SSH remote hosts.
pub struct RemoteStore<'a> {
    conn: &'a Connection,
    cipher: &'a SecretCipher,
}

impl<'a> RemoteStore<'a> {
    pub fn new(conn: &'a Connection, cipher: &'a SecretCipher) -> Self {
        Self { conn, cipher }
    }

    /// Upsert keyed on `(address, ssh_port, user_name)`.
    pub fn insert_or_update(&self, record: &RemoteRecord) -> crate::Result<i64> {
        let sealed = self.cipher.seal_opt(record.secret.as_deref())?;
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM remotes WHERE address = ? AND ssh_port = ? AND user_name = ?",
                params![record.address, record.ssh_port, record.user_name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE remotes SET auth = ?, secret = ? WHERE id = ?",
                    params![record.auth, sealed, id],
                )?;
                Ok(id)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO remotes (address, ssh_port, user_name, auth, secret) \
                     VALUES (?, ?, ?, ?, ?)",
                    params![record.address, record.ssh_port, record.user_name, record.auth, sealed],
                )?;
                Ok(self.conn.last_insert_rowid())
            }
        }
    }

    pub fn get(&self, id: i64) -> crate::Result<Option<RemoteRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, address, ssh_port, user_name, auth, secret, created_at \
             FROM remotes WHERE id = ?",
        )?;
        let record = stmt
            .query_row(params![id], |row| {
                Ok(RemoteRecord {
                    id: row.get(0)?,
                    address: row.get(1)?,
                    ssh_port: row.get(2)?,
                    user_name: row.get(3)?,
                    auth: row.get(4)?,
                    secret: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .optional()?;
        record
            .map(|mut r| {
                r.secret = self.cipher.open_opt(r.secret.as_deref())?;
                Ok(r)
            })
            .transpose()
    }

    pub fn find(&self, address: &str, ssh_port: u16, user_name: &str) -> crate::Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM remotes WHERE address = ? AND ssh_port = ? AND user_name = ?",
                params![address, ssh_port, user_name],
                |row| row.get(0),
            )
            .optional()?)
    }
}

/// Persistence operations for Kubernetes clusters.
pub struct ClusterStore<'a> {
    conn: &'a Connection,
}

impl<'a> ClusterStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Upsert keyed on `(context, namespace)`.
    pub fn insert_or_update(&self, record: &ClusterRecord) -> crate::Result<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM clusters WHERE context = ? AND namespace IS ?",
                params![record.context, record.namespace],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE clusters SET kubeconfig_path = ?, kubeconfig_content = ? WHERE id = ?",
                    params![record.kubeconfig_path, record.kubeconfig_content, id],
                )?;
                Ok(id)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO clusters (context, namespace, kubeconfig_path, kubeconfig_content) \
                     VALUES (?, ?, ?, ?)",
                    params![
                        record.context,
                        record.namespace,
                        record.kubeconfig_path,
                        record.kubeconfig_content
                    ],
                )?;
                Ok(self.conn.last_insert_rowid())
            }
        }
    }

    pub fn get(&self, id: i64) -> crate::Result<Option<ClusterRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, context, namespace, kubeconfig_path, kubeconfig_content, created_at \
             FROM clusters WHERE id = ?",
        )?;
        Ok(stmt
            .query_row(params![id], |row| {
                Ok(ClusterRecord {
                    id: row.get(0)?,
                    context: row.get(1)?,
                    namespace: row.get(2)?,
                    kubeconfig_path: row.get(3)?,
                    kubeconfig_content: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .optional()?)
    }

    /// Persist a namespace chosen at runtime (auto-generated names).
    pub fn update_namespace(&self, id: i64, namespace: &str) -> crate::Result<()> {
        let affected = self.conn.execute(
            "UPDATE clusters SET namespace = ? WHERE id = ?",
            params![namespace, id],
        )?;
        if affected != 1 {
            return Err(crate::Error::not_found(format!("cluster {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, SecretCipher};

    fn db() -> Database {
        Database::open_in_memory(SecretCipher::new(&[1u8; 32])).unwrap()
    }

    fn local_record(name: &str, dir: &str) -> WorkspaceRecord {
        WorkspaceRecord {
            name: name.into(),
            mode: "local".into(),
            working_dir: Some(dir.into()),
            git_url: Some("https://example.com/example.git".into()),
            branch: Some("main".into()),
            git_auth: "public".into(),
            config_path: Some(".ide/config.yaml".into()),
            config_content: Some("version: \"1.0\"".into()),
            manifest_content: Some("services: {}".into()),
            ..Default::default()
        }
    }

    #[test]
    fn insert_get_round_trip() {
        let db = db();
        let conn = db.connection().lock().unwrap();
        let store = WorkspaceStore::new(&conn, db.cipher());

        let id = store.insert(&local_record("one", "/tmp/ws1")).unwrap();
        let loaded = store.get(id).unwrap().unwrap();
        assert_eq!(loaded.name, "one");
        assert_eq!(loaded.mode, "local");
        assert!(!loaded.deleted);
    }

    #[test]
    fn secrets_are_sealed_at_rest() {
        let db = db();
        let conn = db.connection().lock().unwrap();
        let store = WorkspaceStore::new(&conn, db.cipher());

        let mut record = local_record("sec", "/tmp/ws-sec");
        record.git_auth = "basic".into();
        record.git_username = Some("dev".into());
        record.git_secret = Some("p@ssw0rd".into());
        let id = store.insert(&record).unwrap();

        let raw: String = conn
            .query_row("SELECT git_secret FROM workspaces WHERE id = ?", params![id], |r| {
                r.get(0)
            })
            .unwrap();
        assert_ne!(raw, "p@ssw0rd");

        let loaded = store.get(id).unwrap().unwrap();
        assert_eq!(loaded.git_secret.as_deref(), Some("p@ssw0rd"));
    }

    #[test]
    fn validation_rejects_empty_config_for_local() {
        let db = db();
        let conn = db.connection().lock().unwrap();
        let store = WorkspaceStore::new(&conn, db.cipher());

        let mut record = local_record("bad", "/tmp/ws-bad");
        record.config_content = Some("  ".into());
        assert!(matches!(
            store.insert(&record),
            Err(crate::Error::Validation(_))
        ));
    }

    #[test]
    fn validation_rejects_remote_without_host_row() {
        let db = db();
        let conn = db.connection().lock().unwrap();
        let store = WorkspaceStore::new(&conn, db.cipher());

        let mut record = local_record("r", "/home/dev/ws");
        record.mode = "remote".into();
        assert!(matches!(
            store.insert(&record),
            Err(crate::Error::Validation(_))
        ));
    }

    #[test]
    fn find_by_key_matches_natural_key() {
        let db = db();
        let conn = db.connection().lock().unwrap();
        let store = WorkspaceStore::new(&conn, db.cipher());

        let id = store.insert(&local_record("k", "/tmp/ws-k")).unwrap();
        let key = WorkspaceKey {
            mode: "local".into(),
            working_dir: Some("/tmp/ws-k".into()),
            git_url: Some("https://example.com/example.git".into()),
            branch: Some("main".into()),
            config_path: Some(".ide/config.yaml".into()),
            ..Default::default()
        };
        let found = store.find_by_key(&key).unwrap().unwrap();
        assert_eq!(found.id, id);

        let miss = WorkspaceKey {
            branch: Some("develop".into()),
            ..key
        };
        assert!(store.find_by_key(&miss).unwrap().is_none());
    }

    #[test]
    fn soft_delete_hides_row_and_rejects_double_delete() {
        let db = db();
        let conn = db.connection().lock().unwrap();
        let store = WorkspaceStore::new(&conn, db.cipher());

        let id = store.insert(&local_record("del", "/tmp/ws-del")).unwrap();
        store.soft_delete(id).unwrap();

        assert!(store.get(id).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
        assert_eq!(store.list_deleted().unwrap().len(), 1);
        assert!(matches!(
            store.soft_delete(id),
            Err(crate::Error::NotFound(_))
        ));
    }

    #[test]
    fn remote_store_upserts_on_host_key() {
        let db = db();
        let conn = db.connection().lock().unwrap();
        let store = RemoteStore::new(&conn, db.cipher());

        let mut record = RemoteRecord {
            address: "10.0.0.8".into(),
            ssh_port: 22,
            user_name: "dev".into(),
            auth: "password".into(),
            secret: Some("old".into()),
            ..Default::default()
        };
        let first = store.insert_or_update(&record).unwrap();
        record.secret = Some("new".into());
        let second = store.insert_or_update(&record).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            store.get(first).unwrap().unwrap().secret.as_deref(),
            Some("new")
        );
    }

    #[test]
    fn cluster_namespace_update_persists() {
        let db = db();
        let conn = db.connection().lock().unwrap();
        let store = ClusterStore::new(&conn);

        let id = store
            .insert_or_update(&ClusterRecord {
                context: "kind-dev".into(),
                ..Default::default()
            })
            .unwrap();
        store.update_namespace(id, "qzxwvu").unwrap();
        assert_eq!(
            store.get(id).unwrap().unwrap().namespace.as_deref(),
            Some("qzxwvu")
        );
    }
}
