//! Persistence contract for agent, user and checksum-index records.
//!
//! The in-memory engine is the source of truth for liveness; the store is a
//! write-through mirror plus the durable home of registrations and file
//! attribution. Callers that need a correctness-critical read (auth secrets,
//! password hashes) must treat a store error as a denial, never a pass.

use std::collections::HashMap;
use std::sync::Mutex;

use fleet_protocol::{LifecycleState, UpdatedBy};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable record of a registered agent.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: Uuid,
    pub secret_hash: String,
    pub state: LifecycleState,
    pub logged_in_user: Option<String>,
}

/// Durable record of a management user.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub admin: bool,
}

/// Durable checksum-index record, keyed by absolute path.
#[derive(Debug, Clone)]
pub struct StoredFileRecord {
    pub path: String,
    pub store_path: String,
    pub public: bool,
    pub checksum: String,
    pub updated_by: UpdatedBy,
}

pub trait FleetStore: Send + Sync {
    fn put_agent(&self, record: &AgentRecord) -> Result<(), StoreError>;
    fn agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, StoreError>;
    fn agents(&self) -> Result<Vec<AgentRecord>, StoreError>;
    fn set_agent_state(&self, agent_id: Uuid, state: LifecycleState) -> Result<(), StoreError>;
    fn set_logged_in_user(&self, agent_id: Uuid, user: Option<&str>) -> Result<(), StoreError>;

    fn put_user(&self, record: &UserRecord) -> Result<(), StoreError>;
    fn user(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;
    fn users(&self) -> Result<Vec<UserRecord>, StoreError>;

    fn put_file_record(&self, record: &StoredFileRecord) -> Result<(), StoreError>;
    fn file_records(&self) -> Result<Vec<StoredFileRecord>, StoreError>;
}

/// HashMap-backed store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    agents: HashMap<Uuid, AgentRecord>,
    users: HashMap<String, UserRecord>,
    files: HashMap<String, StoredFileRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Backend(format!("lock poisoned: {e}")))
    }
}

impl FleetStore for MemoryStore {
    fn put_agent(&self, record: &AgentRecord) -> Result<(), StoreError> {
        self.lock()?.agents.insert(record.agent_id, record.clone());
        Ok(())
    }

    fn agent(&self, agent_id: Uuid) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.lock()?.agents.get(&agent_id).cloned())
    }

    fn agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(self.lock()?.agents.values().cloned().collect())
    }

    fn set_agent_state(&self, agent_id: Uuid, state: LifecycleState) -> Result<(), StoreError> {
        if let Some(record) = self.lock()?.agents.get_mut(&agent_id) {
            record.state = state;
        }
        Ok(())
    }

    fn set_logged_in_user(&self, agent_id: Uuid, user: Option<&str>) -> Result<(), StoreError> {
        if let Some(record) = self.lock()?.agents.get_mut(&agent_id) {
            record.logged_in_user = user.map(str::to_string);
        }
        Ok(())
    }

    fn put_user(&self, record: &UserRecord) -> Result<(), StoreError> {
        self.lock()?
            .users
            .insert(record.username.clone(), record.clone());
        Ok(())
    }

    fn user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.lock()?.users.get(username).cloned())
    }

    fn users(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.lock()?.users.values().cloned().collect())
    }

    fn put_file_record(&self, record: &StoredFileRecord) -> Result<(), StoreError> {
        self.lock()?.files.insert(record.path.clone(), record.clone());
        Ok(())
    }

    fn file_records(&self) -> Result<Vec<StoredFileRecord>, StoreError> {
        Ok(self.lock()?.files.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_round_trip_and_state_update() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store
            .put_agent(&AgentRecord {
                agent_id: id,
                secret_hash: "h".into(),
                state: LifecycleState::Unknown,
                logged_in_user: None,
            })
            .unwrap();

        store.set_agent_state(id, LifecycleState::Online).unwrap();
        store.set_logged_in_user(id, Some("alice")).unwrap();

        let record = store.agent(id).unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Online);
        assert_eq!(record.logged_in_user.as_deref(), Some("alice"));
    }

    #[test]
    fn missing_rows_are_none_not_errors() {
        let store = MemoryStore::new();
        assert!(store.agent(Uuid::new_v4()).unwrap().is_none());
        assert!(store.user("nobody").unwrap().is_none());
    }

    #[test]
    fn file_records_key_on_absolute_path() {
        let store = MemoryStore::new();
        let record = StoredFileRecord {
            path: "/srv/fts/publicStore/motd.txt".into(),
            store_path: "motd.txt".into(),
            public: true,
            checksum: "aa".repeat(32),
            updated_by: UpdatedBy::Server,
        };
        store.put_file_record(&record).unwrap();
        store
            .put_file_record(&StoredFileRecord {
                updated_by: UpdatedBy::Client,
                ..record.clone()
            })
            .unwrap();

        let all = store.file_records().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].updated_by, UpdatedBy::Client);
    }
}
