//! SQLite-backed implementation of the persistence contract.
//!
//! All access goes through a `std::sync::Mutex<Connection>`; callers on the
//! async side wrap store-heavy work in `spawn_blocking` so synchronous
//! SQLite I/O never blocks the runtime.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex as StdMutex;

use fleet_core::{AgentRecord, FleetStore, StoreError, StoredFileRecord, UserRecord};
use fleet_protocol::{LifecycleState, UpdatedBy};
use rusqlite::Connection;
use uuid::Uuid;

pub struct SqliteStore {
    conn: StdMutex<Connection>,
}

impl SqliteStore {
    pub fn open(state_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let db_path = state_dir.join("fleet.db");
        let conn = Connection::open(&db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                agent_id        TEXT PRIMARY KEY NOT NULL,
                secret_hash     TEXT NOT NULL,
                state           TEXT NOT NULL,
                logged_in_user  TEXT
            );
            CREATE TABLE IF NOT EXISTS users (
                username        TEXT PRIMARY KEY NOT NULL,
                password_hash   TEXT NOT NULL,
                admin           INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS file_index (
                path            TEXT PRIMARY KEY NOT NULL,
                store_path      TEXT NOT NULL,
                public          INTEGER NOT NULL,
                checksum        TEXT NOT NULL,
                updated_by      TEXT NOT NULL
            );",
        )?;

        let agents: i64 = conn
            .query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))
            .unwrap_or(0);
        if agents > 0 {
            tracing::info!(agents, "loaded fleet store from disk");
        }

        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn parse_state(s: &str) -> LifecycleState {
    LifecycleState::from_str(s).unwrap_or(LifecycleState::Unknown)
}

fn parse_agent_id(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Backend(format!("bad agent id in store: {e}")))
}

fn updated_by_str(u: UpdatedBy) -> &'static str {
    match u {
        UpdatedBy::Server => "server",
        UpdatedBy::Client => "client",
    }
}

fn parse_updated_by(s: &str) -> UpdatedBy {
    if s == "client" {
        UpdatedBy::Client
    } else {
        UpdatedBy::Server
    }
}

impl FleetStore for SqliteStore {
    fn put_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        self.lock()?
            .execute(
                "INSERT INTO agents (agent_id, secret_hash, state, logged_in_user)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(agent_id) DO UPDATE SET
                     secret_hash = excluded.secret_hash,
                     state = excluded.state,
                     logged_in_user = excluded.logged_in_user",
                rusqlite::params![
                    record.agent_id.to_string(),
                    record.secret_hash,
                    record.state.as_str(),
                    record.logged_in_user,
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, StoreError> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT secret_hash, state, logged_in_user FROM agents WHERE agent_id = ?1",
            [agent_id.to_string()],
            |row| {
                Ok(AgentRecord {
                    agent_id,
                    secret_hash: row.get(0)?,
                    state: parse_state(&row.get::<_, String>(1)?),
                    logged_in_user: row.get(2)?,
                })
            },
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    fn agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT agent_id, secret_hash, state, logged_in_user FROM agents")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (id, secret_hash, state, logged_in_user) = row.map_err(db_err)?;
            out.push(AgentRecord {
                agent_id: parse_agent_id(&id)?,
                secret_hash,
                state: parse_state(&state),
                logged_in_user,
            });
        }
        Ok(out)
    }

    fn set_agent_state(&self, agent_id: Uuid, state: LifecycleState) -> Result<(), StoreError> {
        self.lock()?
            .execute(
                "UPDATE agents SET state = ?2 WHERE agent_id = ?1",
                rusqlite::params![agent_id.to_string(), state.as_str()],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn set_logged_in_user(&self, agent_id: Uuid, user: Option<&str>) -> Result<(), StoreError> {
        self.lock()?
            .execute(
                "UPDATE agents SET logged_in_user = ?2 WHERE agent_id = ?1",
                rusqlite::params![agent_id.to_string(), user],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn put_user(&self, record: &UserRecord) -> Result<(), StoreError> {
        self.lock()?
            .execute(
                "INSERT INTO users (username, password_hash, admin)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(username) DO UPDATE SET
                     password_hash = excluded.password_hash,
                     admin = excluded.admin",
                rusqlite::params![record.username, record.password_hash, record.admin],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT password_hash, admin FROM users WHERE username = ?1",
            [username],
            |row| {
                Ok(UserRecord {
                    username: username.to_string(),
                    password_hash: row.get(0)?,
                    admin: row.get(1)?,
                })
            },
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    fn users(&self) -> Result<Vec<UserRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT username, password_hash, admin FROM users")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(UserRecord {
                    username: row.get(0)?,
                    password_hash: row.get(1)?,
                    admin: row.get(2)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn put_file_record(&self, record: &StoredFileRecord) -> Result<(), StoreError> {
        self.lock()?
            .execute(
                "INSERT INTO file_index (path, store_path, public, checksum, updated_by)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(path) DO UPDATE SET
                     store_path = excluded.store_path,
                     public = excluded.public,
                     checksum = excluded.checksum,
                     updated_by = excluded.updated_by",
                rusqlite::params![
                    record.path,
                    record.store_path,
                    record.public,
                    record.checksum,
                    updated_by_str(record.updated_by),
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn file_records(&self) -> Result<Vec<StoredFileRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT path, store_path, public, checksum, updated_by FROM file_index")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoredFileRecord {
                    path: row.get(0)?,
                    store_path: row.get(1)?,
                    public: row.get(2)?,
                    checksum: row.get(3)?,
                    updated_by: parse_updated_by(&row.get::<_, String>(4)?),
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }
}
