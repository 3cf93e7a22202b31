//! Database connection management.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::secret::SecretCipher;

/// Database connection wrapper shared by the registry stores.
#[derive(Clone)]
pub struct Database {
    connection: Arc<Mutex<Connection>>,
    cipher: Arc<SecretCipher>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Default database path: `$WD_HOME/registry.db`, falling back to
    /// `~/.workdock/registry.db`.
    pub fn default_path() -> crate::Result<PathBuf> {
        if let Ok(wd_home) = std::env::var("WD_HOME") {
            return Ok(PathBuf::from(wd_home).join("registry.db"));
        }
        let home = std::env::var("HOME")
            .map_err(|_| crate::Error::validation("HOME environment variable not set"))?;
        Ok(PathBuf::from(home).join(".workdock").join("registry.db"))
    }

    /// Open the database at the default path.
    pub fn open_default(cipher: SecretCipher) -> crate::Result<Self> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(&path, cipher)
    }

    /// Open a database connection, creating the file and schema if needed.
    pub fn open<P: AsRef<Path>>(path: P, cipher: SecretCipher) -> crate::Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
            cipher: Arc::new(cipher),
        })
    }

    /// Open an in-memory database for testing.
    pub fn open_in_memory(cipher: SecretCipher) -> crate::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(conn)),
            cipher: Arc::new(cipher),
        })
    }

    fn initialize_schema(conn: &Connection) -> crate::Result<()> {
        // WAL keeps concurrent readers out of the writer's way
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        crate::migrations::MigrationManager::migrate(conn)?;
        Ok(())
    }

    /// Cipher used for secret columns.
    pub fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    /// Access the underlying connection mutex.
    pub fn connection(&self) -> &Mutex<Connection> {
        &self.connection
    }

    /// Execute a closure inside a transaction with rollback on error.
    pub fn transaction<F, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce(&Connection) -> crate::Result<T>,
    {
        let conn = self
            .connection
            .lock()
            .map_err(|e| crate::Error::conflict(format!("database lock poisoned: {}", e)))?;

        let tx = conn.unchecked_transaction()?;
        match f(&tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }
}
