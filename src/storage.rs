use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub server: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionCookie {
    pub account_id: i64,
    pub cookie: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("storage: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("storage: enable foreign keys")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("storage: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("storage: close connection")
    }

    pub fn upsert_account(&self, server: &str, username: &str) -> Result<i64> {
        if username.trim().is_empty() {
            bail!("storage: username required");
        }
        let now = Utc::now().timestamp();
        let conn = self.conn.lock();
        let id: i64 = conn.query_row(
            r#"
INSERT INTO accounts (server, username, created_at, updated_at)
VALUES (?1, ?2, ?3, ?3)
ON CONFLICT(server, username) DO UPDATE SET
  updated_at = excluded.updated_at
RETURNING id
"#,
            params![server, username, now],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_account_by_id(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT id, server, username, created_at, updated_at
FROM accounts
WHERE id = ?1
"#,
            params![id],
            account_from_row,
        )
        .optional()
        .context("storage: query account by id")
    }

    pub fn find_account(&self, server: &str, username: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT id, server, username, created_at, updated_at
FROM accounts
WHERE server = ?1 AND username = ?2
"#,
            params![server, username],
            account_from_row,
        )
        .optional()
        .context("storage: query account by name")
    }

    /// Most recently used first.
    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
SELECT id, server, username, created_at, updated_at
FROM accounts
ORDER BY updated_at DESC, id DESC
"#,
        )?;
        let rows = stmt
            .query_map([], account_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn touch_account(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE accounts SET updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn upsert_session(&self, account_id: i64, cookie: &str) -> Result<()> {
        if account_id == 0 {
            bail!("storage: account id required for session");
        }
        if cookie.is_empty() {
            bail!("storage: session cookie required");
        }
        let conn = self.conn.lock();
        conn.execute(
            r#"
INSERT INTO sessions (account_id, cookie, created_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(account_id) DO UPDATE SET
  cookie = excluded.cookie,
  created_at = excluded.created_at
"#,
            params![account_id, cookie, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_session(&self, account_id: i64) -> Result<Option<SessionCookie>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
SELECT account_id, cookie, created_at
FROM sessions
WHERE account_id = ?1
"#,
            params![account_id],
            |row| {
                let created: i64 = row.get(2)?;
                Ok(SessionCookie {
                    account_id: row.get(0)?,
                    cookie: row.get(1)?,
                    created_at: timestamp(created),
                })
            },
        )
        .optional()
        .context("storage: query session")
    }

    pub fn delete_session(&self, account_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sessions WHERE account_id = ?1",
            params![account_id],
        )?;
        Ok(())
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let created: i64 = row.get(3)?;
    let updated: i64 = row.get(4)?;
    Ok(Account {
        id: row.get(0)?,
        server: row.get(1)?,
        username: row.get(2)?,
        created_at: timestamp(created),
        updated_at: timestamp(updated),
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let migrations = migrations();
    for (idx, sql) in migrations.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![r#"
CREATE TABLE IF NOT EXISTS accounts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  server TEXT NOT NULL,
  username TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  UNIQUE(server, username)
);

CREATE TABLE IF NOT EXISTS sessions (
  account_id INTEGER PRIMARY KEY,
  cookie TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  FOREIGN KEY(account_id) REFERENCES accounts(id) ON DELETE CASCADE
);
"#]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("newsblur-fix").join("state.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir) -> Store {
        Store::open(Options {
            path: Some(dir.path().join("state.db")),
        })
        .unwrap()
    }

    #[test]
    fn open_creates_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let store = Store::open(Options {
            path: Some(path.clone()),
        })
        .unwrap();
        assert!(path.exists());
        store.close().unwrap();
    }

    #[test]
    fn account_upsert_is_idempotent_per_server() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        let first = store.upsert_account("https://www.newsblur.com/", "reader").unwrap();
        let again = store.upsert_account("https://www.newsblur.com/", "reader").unwrap();
        let other = store.upsert_account("http://localhost/", "reader").unwrap();
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(store.list_accounts().unwrap().len(), 2);
        let found = store
            .find_account("http://localhost/", "reader")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, other);
        assert!(store.upsert_account("x", "  ").is_err());
    }

    #[test]
    fn sessions_replace_and_delete() {
        let dir = tempdir().unwrap();
        let store = open(&dir);
        let id = store.upsert_account("s", "reader").unwrap();
        assert!(store.get_session(id).unwrap().is_none());
        store.upsert_session(id, "one").unwrap();
        store.upsert_session(id, "two").unwrap();
        assert_eq!(store.get_session(id).unwrap().unwrap().cookie, "two");
        store.delete_session(id).unwrap();
        assert!(store.get_session(id).unwrap().is_none());
        assert!(store.upsert_session(0, "x").is_err());
    }

    #[test]
    fn reopening_keeps_data() {
        let dir = tempdir().unwrap();
        let id = {
            let store = open(&dir);
            let id = store.upsert_account("s", "reader").unwrap();
            store.upsert_session(id, "cookie").unwrap();
            store.close().unwrap();
            id
        };
        let store = open(&dir);
        assert_eq!(store.get_account_by_id(id).unwrap().unwrap().username, "reader");
        assert_eq!(store.get_session(id).unwrap().unwrap().cookie, "cookie");
    }
}
