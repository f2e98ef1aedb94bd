//! Authoritative table of live agent and management sessions.
//!
//! The registry owns session lifetime end to end: issuance, structural
//! token verification, heartbeat liveness, lifecycle transitions and the
//! periodic expiry sweep. In-memory state is the source of truth; lifecycle
//! changes are mirrored to the store write-through, best effort.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fleet_crypto::digest::{hash_secret, random_secret, sha256_hex};
use fleet_crypto::keys::ServerKeys;
use fleet_crypto::token::{self, AgentToken, DeployToken, ManagementToken, Token};
use fleet_protocol::{
    AgentSummary, LifecycleState, Operation, OperationKind, OperationState, UpdateCounters,
    UserSummary,
};
use uuid::Uuid;

use crate::error::FleetError;
use crate::session::AgentSession;
use crate::store::{AgentRecord, FleetStore, UserRecord};

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub agent_ttl_ms: u64,
    pub mgmt_ttl_ms: u64,
    pub heartbeat_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            agent_ttl_ms: 30 * 60 * 1000,
            mgmt_ttl_ms: 10 * 60 * 1000,
            // 2x the expected 15 s heartbeat period.
            heartbeat_timeout_ms: 30 * 1000,
        }
    }
}

pub struct SessionRegistry {
    server_id: String,
    keys: Arc<ServerKeys>,
    store: Arc<dyn FleetStore>,
    config: RegistryConfig,
    agents: DashMap<Uuid, AgentSession>,
    mgmt: DashMap<String, ManagementToken>,
}

impl SessionRegistry {
    /// A fresh `server_id` per construction; tokens signed by a previous
    /// process never verify against this registry.
    pub fn new(keys: Arc<ServerKeys>, store: Arc<dyn FleetStore>, config: RegistryConfig) -> Self {
        Self {
            server_id: Uuid::new_v4().to_string(),
            keys,
            store,
            config,
            agents: DashMap::new(),
            mgmt: DashMap::new(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn keys(&self) -> &ServerKeys {
        &self.keys
    }

    // ------------------------------------------------------------------
    // Issuance

    /// Issue an agent session token. At most one live session per agent.
    pub fn issue_agent_token(
        &self,
        agent_id: Uuid,
        auth_secret: &str,
        now_ms: u64,
    ) -> Result<String, FleetError> {
        let record = self
            .store
            .agent(agent_id)?
            .ok_or(FleetError::AgentNotRegistered(agent_id))?;
        if hash_secret(auth_secret) != record.secret_hash {
            tracing::warn!(agent_id = %agent_id, "agent auth secret mismatch");
            return Err(FleetError::AuthMismatch);
        }

        let agent_token = AgentToken {
            server_id: self.server_id.clone(),
            agent_id,
            issued_at_ms: now_ms,
            ttl_ms: self.config.agent_ttl_ms,
        };
        match self.agents.entry(agent_id) {
            Entry::Occupied(_) => return Err(FleetError::SessionAlreadyIssued(agent_id)),
            Entry::Vacant(slot) => {
                slot.insert(AgentSession::new(agent_token.clone(), now_ms));
            }
        }
        self.mirror_state(agent_id, LifecycleState::Online);
        tracing::info!(agent_id = %agent_id, "agent session issued");
        Ok(token::encode(&Token::Agent(agent_token), self.keys.signing())?)
    }

    /// Issue a management session token. At most one live session per
    /// source IP.
    pub fn issue_management_token(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
        now_ms: u64,
    ) -> Result<String, FleetError> {
        let user = self
            .store
            .user(username)?
            .ok_or_else(|| FleetError::UserNotFound(username.to_string()))?;
        if hash_secret(password) != user.password_hash {
            tracing::warn!(username, client_ip, "management password mismatch");
            return Err(FleetError::PasswordMismatch);
        }

        let mgmt_token = ManagementToken {
            server_id: self.server_id.clone(),
            client_ip: client_ip.to_string(),
            issued_at_ms: now_ms,
            ttl_ms: self.config.mgmt_ttl_ms,
        };
        match self.mgmt.entry(client_ip.to_string()) {
            Entry::Occupied(_) => {
                return Err(FleetError::AlreadyLoggedInFromIp(client_ip.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(mgmt_token.clone());
            }
        }
        tracing::info!(username, client_ip, "management session issued");
        Ok(token::encode(
            &Token::Management(mgmt_token),
            self.keys.signing(),
        )?)
    }

    // ------------------------------------------------------------------
    // Verification

    /// Verify a wire token as a live agent token. Signature validity and
    /// registry liveness are independent checks; both must pass, and the
    /// presented fields must structurally equal the live record's.
    pub fn verify_agent_token(&self, wire: &str) -> Result<AgentToken, FleetError> {
        let presented = token::decode(wire, self.keys.verifying())?.into_agent()?;
        match self.agents.get(&presented.agent_id) {
            Some(session) if session.token == presented => Ok(presented),
            _ => Err(FleetError::TokenRejected),
        }
    }

    pub fn verify_management_token(&self, wire: &str) -> Result<ManagementToken, FleetError> {
        let presented = token::decode(wire, self.keys.verifying())?.into_management()?;
        match self.mgmt.get(&presented.client_ip) {
            Some(live) if *live == presented => Ok(presented),
            _ => Err(FleetError::TokenRejected),
        }
    }

    // ------------------------------------------------------------------
    // Liveness and lifecycle

    /// Refresh liveness and counters. Never extends the token TTL; the
    /// agent must re-request a token before it expires.
    pub fn record_heartbeat(
        &self,
        agent_id: Uuid,
        counters: UpdateCounters,
        now_ms: u64,
    ) -> Result<(), FleetError> {
        match self.agents.get_mut(&agent_id) {
            Some(mut session) => {
                session.heartbeat(now_ms, counters);
                Ok(())
            }
            None => Err(FleetError::NoActiveSession(agent_id)),
        }
    }

    /// Record a reported lifecycle state. SHUTDOWN and SLEEP also close
    /// the session; the agent re-requests a token on next boot or wake.
    pub fn transition_state(
        &self,
        agent_id: Uuid,
        state: LifecycleState,
    ) -> Result<(), FleetError> {
        match self.agents.get_mut(&agent_id) {
            Some(mut session) => session.state = state,
            None => return Err(FleetError::NoActiveSession(agent_id)),
        }
        self.mirror_state(agent_id, state);
        if matches!(state, LifecycleState::Shutdown | LifecycleState::Sleep) {
            self.agents.remove(&agent_id);
            tracing::info!(agent_id = %agent_id, state = %state, "agent session closed");
        }
        Ok(())
    }

    pub fn management_logout(&self, client_ip: &str) {
        if self.mgmt.remove(client_ip).is_some() {
            tracing::info!(client_ip, "management session logged out");
        }
    }

    /// One sweep pass at the given clock reading. Evicts agent sessions
    /// whose token expired or whose heartbeat went silent, and expired
    /// management sessions. Idempotent; eviction is routine, logged,
    /// never escalated.
    pub fn sweep_at(&self, now_ms: u64) {
        let expired: Vec<Uuid> = self
            .agents
            .iter()
            .filter(|entry| self.agent_expired(entry.value(), now_ms))
            .map(|entry| *entry.key())
            .collect();

        for agent_id in expired {
            // Last known state becomes unknown before the record goes,
            // so a concurrent query never sees a stale ONLINE.
            let mut evict = false;
            if let Some(mut session) = self.agents.get_mut(&agent_id) {
                if self.agent_expired(&session, now_ms) {
                    session.state = LifecycleState::Unknown;
                    evict = true;
                }
            }
            if evict {
                self.mirror_state(agent_id, LifecycleState::Unknown);
                self.agents.remove(&agent_id);
                tracing::info!(agent_id = %agent_id, "agent session evicted");
            }
        }

        self.mgmt.retain(|client_ip, mgmt_token| {
            let live = !mgmt_token.is_expired(now_ms);
            if !live {
                tracing::info!(client_ip = %client_ip, "management session expired");
            }
            live
        });
    }

    /// Signed authorization for a new machine to self-register. Bound to
    /// this process's server id, so it dies with the process.
    pub fn issue_deploy_token(&self) -> Result<String, FleetError> {
        let deploy = DeployToken {
            server_id: self.server_id.clone(),
            hash: self.deployment_hash(),
        };
        Ok(token::encode(&Token::Deploy(deploy), self.keys.signing())?)
    }

    /// Register a new agent on presentation of a valid deploy token.
    pub fn redeem_deploy_token(&self, wire: &str) -> Result<(Uuid, String), FleetError> {
        let presented = token::decode(wire, self.keys.verifying())?.into_deploy()?;
        if presented.server_id != self.server_id || presented.hash != self.deployment_hash() {
            tracing::warn!("deploy token hash mismatch");
            return Err(FleetError::TokenRejected);
        }
        self.register_agent()
    }

    fn deployment_hash(&self) -> String {
        sha256_hex(self.server_id.as_bytes())
    }

    fn agent_expired(&self, session: &AgentSession, now_ms: u64) -> bool {
        session.token.is_expired(now_ms)
            || now_ms.saturating_sub(session.last_heartbeat_ms) >= self.config.heartbeat_timeout_ms
    }

    fn mirror_state(&self, agent_id: Uuid, state: LifecycleState) {
        if let Err(e) = self.store.set_agent_state(agent_id, state) {
            tracing::warn!(agent_id = %agent_id, error = %e, "failed to mirror lifecycle state");
        }
    }

    // ------------------------------------------------------------------
    // Operation queue

    pub fn enqueue_for(
        &self,
        agent_id: Uuid,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<u64, FleetError> {
        match self.agents.get_mut(&agent_id) {
            Some(mut session) => session.enqueue(kind, payload),
            None => Err(FleetError::NoActiveSession(agent_id)),
        }
    }

    pub fn queue_snapshot(&self, agent_id: Uuid) -> Result<Vec<Operation>, FleetError> {
        match self.agents.get(&agent_id) {
            Some(session) => Ok(session.snapshot()),
            None => Err(FleetError::NoActiveSession(agent_id)),
        }
    }

    pub fn report_status(
        &self,
        agent_id: Uuid,
        sequence: u64,
        state: OperationState,
        message: String,
    ) -> Result<(), FleetError> {
        match self.agents.get_mut(&agent_id) {
            Some(mut session) => {
                session.report_status(sequence, state, message);
                Ok(())
            }
            None => Err(FleetError::NoActiveSession(agent_id)),
        }
    }

    // ------------------------------------------------------------------
    // Registration and user auth

    /// Register a new agent: fresh id, fresh random secret. Returns the
    /// plaintext secret exactly once; only its hash is stored.
    pub fn register_agent(&self) -> Result<(Uuid, String), FleetError> {
        let mut agent_id = Uuid::new_v4();
        while self.store.agent(agent_id)?.is_some() {
            agent_id = Uuid::new_v4();
        }
        let secret = random_secret();
        self.store.put_agent(&AgentRecord {
            agent_id,
            secret_hash: hash_secret(&secret),
            state: LifecycleState::Unknown,
            logged_in_user: None,
        })?;
        tracing::info!(agent_id = %agent_id, "agent registered");
        Ok((agent_id, secret))
    }

    pub fn register_user(
        &self,
        username: &str,
        password: &str,
        admin: bool,
    ) -> Result<(), FleetError> {
        validate_username(username)?;
        if self.store.user(username)?.is_some() {
            return Err(FleetError::UsernameTaken(username.to_string()));
        }
        self.store.put_user(&UserRecord {
            username: username.to_string(),
            password_hash: hash_secret(password),
            admin,
        })?;
        tracing::info!(username, admin, "user registered");
        Ok(())
    }

    /// Sign a user in on an agent. One user per agent at a time.
    pub fn login(&self, agent_id: Uuid, username: &str, password: &str) -> Result<(), FleetError> {
        let record = self
            .store
            .agent(agent_id)?
            .ok_or(FleetError::AgentNotRegistered(agent_id))?;
        if let Some(existing) = record.logged_in_user {
            return Err(FleetError::UserAlreadyLoggedIn {
                agent_id,
                username: existing,
            });
        }
        let user = self
            .store
            .user(username)?
            .ok_or_else(|| FleetError::UserNotFound(username.to_string()))?;
        if hash_secret(password) != user.password_hash {
            tracing::warn!(agent_id = %agent_id, username, "login password mismatch");
            return Err(FleetError::PasswordMismatch);
        }
        self.store.set_logged_in_user(agent_id, Some(username))?;
        tracing::info!(agent_id = %agent_id, username, "user logged in");
        Ok(())
    }

    /// Sign the current user out of an agent. Returns the username that
    /// was signed in.
    pub fn logout(&self, agent_id: Uuid) -> Result<String, FleetError> {
        let record = self
            .store
            .agent(agent_id)?
            .ok_or(FleetError::AgentNotRegistered(agent_id))?;
        let username = record.logged_in_user.ok_or(FleetError::NoUserLoggedIn)?;
        self.store.set_logged_in_user(agent_id, None)?;
        tracing::info!(agent_id = %agent_id, username, "user logged out");
        Ok(username)
    }

    pub fn logged_in_user(&self, agent_id: Uuid) -> Result<Option<String>, FleetError> {
        Ok(self
            .store
            .agent(agent_id)?
            .ok_or(FleetError::AgentNotRegistered(agent_id))?
            .logged_in_user)
    }

    pub fn user_is_admin(&self, username: &str) -> Result<bool, FleetError> {
        Ok(self
            .store
            .user(username)?
            .ok_or_else(|| FleetError::UserNotFound(username.to_string()))?
            .admin)
    }

    // ------------------------------------------------------------------
    // Query surface

    /// Lifecycle state of an agent: live session if present, else the
    /// persisted last-known state.
    pub fn agent_state(&self, agent_id: Uuid) -> Result<LifecycleState, FleetError> {
        if let Some(session) = self.agents.get(&agent_id) {
            return Ok(session.state);
        }
        Ok(self
            .store
            .agent(agent_id)?
            .ok_or(FleetError::AgentNotRegistered(agent_id))?
            .state)
    }

    /// Every registered agent with its state; counters, queue length and
    /// operation status only for agents holding a live session.
    pub fn fleet_snapshot(&self) -> Result<BTreeMap<Uuid, AgentSummary>, FleetError> {
        let mut out = BTreeMap::new();
        for record in self.store.agents()? {
            let summary = match self.agents.get(&record.agent_id) {
                Some(session) => AgentSummary {
                    state: session.state,
                    counters: session.counters,
                    queue_len: Some(session.queue_len()),
                    status: Some(session.status().clone()),
                },
                None => AgentSummary {
                    state: record.state,
                    counters: None,
                    queue_len: None,
                    status: None,
                },
            };
            out.insert(record.agent_id, summary);
        }
        Ok(out)
    }

    pub fn user_summaries(&self) -> Result<BTreeMap<String, UserSummary>, FleetError> {
        let agents = self.store.agents()?;
        let mut out = BTreeMap::new();
        for user in self.store.users()? {
            let signed_in = agents
                .iter()
                .any(|a| a.logged_in_user.as_deref() == Some(user.username.as_str()));
            out.insert(
                user.username,
                UserSummary {
                    admin: user.admin,
                    signed_in,
                },
            );
        }
        Ok(out)
    }

    pub fn live_agent_count(&self) -> usize {
        self.agents.len()
    }
}

/// Usernames name directories in the private store; separators and
/// traversal components are rejected before anything is persisted.
pub fn validate_username(username: &str) -> Result<(), FleetError> {
    if username.is_empty() || username.contains(['/', '\\', '\0']) || username == ".." {
        return Err(FleetError::InvalidUsername(username.to_string()));
    }
    Ok(())
}
