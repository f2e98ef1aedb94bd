//! Dispatch facade: the only caller into the registry and index from the
//! transport. Verifies the token layer first, then authorization, then
//! performs the operation. Blocking file work runs on `spawn_blocking`.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use fleet_core::{ChecksumIndex, FleetError, SessionRegistry, now_ms};
use fleet_crypto::token;
use fleet_protocol::{ErrorCode, OperationKind, Request, Response};
use serde_json::json;

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    index: Arc<ChecksumIndex>,
    allow_executable_update: bool,
    allow_deployment: bool,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        index: Arc<ChecksumIndex>,
        allow_executable_update: bool,
        allow_deployment: bool,
    ) -> Self {
        Self {
            registry,
            index,
            allow_executable_update,
            allow_deployment,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Handle one request from the given peer. Always produces a response;
    /// errors are mapped to stable codes with sanitized messages.
    pub async fn handle(&self, request: Request, peer_ip: &str) -> Response {
        match self.dispatch(request, peer_ip).await {
            Ok(data) => Response::Ok { data },
            Err(e) => {
                let (code, message) = e.to_error_code();
                if code == ErrorCode::Internal {
                    tracing::error!(error = %e, peer_ip, "request failed internally");
                } else {
                    tracing::debug!(error = %e, peer_ip, "request rejected");
                }
                Response::Error { message, code }
            }
        }
    }

    async fn dispatch(
        &self,
        request: Request,
        peer_ip: &str,
    ) -> Result<Option<serde_json::Value>, FleetError> {
        match request {
            // ----------------------------------------------------------
            // Sessions
            Request::TokenRequest { agent_id, auth } => {
                let wire = self.registry.issue_agent_token(agent_id, &auth, now_ms())?;
                Ok(Some(json!({ "token": wire })))
            }
            Request::MgmtTokenRequest { username, password } => {
                let wire =
                    self.registry
                        .issue_management_token(&username, &password, peer_ip, now_ms())?;
                Ok(Some(json!({ "token": wire })))
            }
            Request::MgmtLogout { token } => {
                let mgmt = self.registry.verify_management_token(&token)?;
                self.registry.management_logout(&mgmt.client_ip);
                Ok(None)
            }
            Request::Heartbeat { token, counters } => {
                let agent = self.registry.verify_agent_token(&token)?;
                self.registry
                    .record_heartbeat(agent.agent_id, counters, now_ms())?;
                Ok(None)
            }
            Request::UpdateState { token, state } => {
                let agent = self.registry.verify_agent_token(&token)?;
                self.registry.transition_state(agent.agent_id, state)?;
                Ok(None)
            }

            // ----------------------------------------------------------
            // Operations
            Request::GetQueue { token } => {
                let agent = self.registry.verify_agent_token(&token)?;
                let queue = self.registry.queue_snapshot(agent.agent_id)?;
                let payload = json!({ "queue": queue });
                let signed = token::seal(&payload, self.registry.keys().signing())?;
                Ok(Some(json!({ "signed_queue": signed })))
            }
            Request::UpdateStatus {
                token,
                sequence,
                state,
                message,
            } => {
                let agent = self.registry.verify_agent_token(&token)?;
                self.registry
                    .report_status(agent.agent_id, sequence, state, message)?;
                Ok(None)
            }
            Request::AddOperation {
                token,
                targets,
                kind,
                payload,
            } => {
                self.registry.verify_management_token(&token)?;
                if kind == OperationKind::UpdateAgentExecutable && !self.allow_executable_update {
                    return Err(FleetError::OperationDisabled("update_agent_executable"));
                }
                let mut queued = serde_json::Map::new();
                let mut failed = serde_json::Map::new();
                for agent_id in targets {
                    match self.registry.enqueue_for(agent_id, kind, payload.clone()) {
                        Ok(sequence) => {
                            queued.insert(agent_id.to_string(), json!(sequence));
                        }
                        Err(e) => {
                            failed.insert(agent_id.to_string(), json!(e.to_string()));
                        }
                    }
                }
                Ok(Some(json!({ "queued": queued, "failed": failed })))
            }

            // ----------------------------------------------------------
            // Queries
            Request::QueryState { token, agent_id } => {
                self.registry.verify_management_token(&token)?;
                let state = self.registry.agent_state(agent_id)?;
                Ok(Some(json!({ "state": state })))
            }
            Request::QueryFleet { token } => {
                self.registry.verify_management_token(&token)?;
                let snapshot = self.registry.fleet_snapshot()?;
                Ok(Some(json!({ "agents": snapshot })))
            }
            Request::QueryUsers { token } => {
                self.registry.verify_management_token(&token)?;
                let users = self.registry.user_summaries()?;
                Ok(Some(json!({ "users": users })))
            }

            // ----------------------------------------------------------
            // Registration and user auth
            Request::RegisterAgent { token } => {
                self.registry.verify_management_token(&token)?;
                let (agent_id, secret) = self.registry.register_agent()?;
                // The plaintext secret is returned here and never again.
                Ok(Some(json!({ "agent_id": agent_id, "auth": secret })))
            }
            Request::RequestDeployToken { token } => {
                self.registry.verify_management_token(&token)?;
                if !self.allow_deployment {
                    return Err(FleetError::OperationDisabled("deployment"));
                }
                let wire = self.registry.issue_deploy_token()?;
                Ok(Some(json!({ "token": wire })))
            }
            Request::DeployJoin { token } => {
                if !self.allow_deployment {
                    return Err(FleetError::OperationDisabled("deployment"));
                }
                let (agent_id, secret) = self.registry.redeem_deploy_token(&token)?;
                Ok(Some(json!({ "agent_id": agent_id, "auth": secret })))
            }
            Request::RegisterUser {
                token,
                username,
                password,
                admin,
            } => {
                self.registry.verify_management_token(&token)?;
                self.registry.register_user(&username, &password, admin)?;
                self.index.ensure_user_dir(&username)?;
                Ok(None)
            }
            Request::Login {
                token,
                username,
                password,
            } => {
                let agent = self.registry.verify_agent_token(&token)?;
                self.registry.login(agent.agent_id, &username, &password)?;
                Ok(None)
            }
            Request::Logout { token } => {
                let agent = self.registry.verify_agent_token(&token)?;
                let username = self.registry.logout(agent.agent_id)?;
                Ok(Some(json!({ "username": username })))
            }

            // ----------------------------------------------------------
            // File transfer store
            Request::Upload {
                token,
                public,
                path,
                name,
                data,
            } => {
                let agent = self.registry.verify_agent_token(&token)?;
                let username = self
                    .registry
                    .logged_in_user(agent.agent_id)?
                    .ok_or(FleetError::NoUserLoggedIn)?;
                if public && !self.registry.user_is_admin(&username)? {
                    return Err(FleetError::NotAdmin(username));
                }
                let store_path = scoped_path(public, &username, &path, &name);
                let index = Arc::clone(&self.index);
                let checksum =
                    run_blocking(move || index.store_upload(public, &store_path, &data)).await?;
                Ok(Some(json!({ "checksum": checksum })))
            }
            Request::Download {
                token,
                public,
                path,
            } => {
                let agent = self.registry.verify_agent_token(&token)?;
                let store_path = if public {
                    path
                } else {
                    let username = self
                        .registry
                        .logged_in_user(agent.agent_id)?
                        .ok_or(FleetError::NoUserLoggedIn)?;
                    format!("{username}/{path}")
                };
                let index = Arc::clone(&self.index);
                let data =
                    run_blocking(move || index.read_file(public, &store_path)).await?;
                Ok(Some(json!({ "data": BASE64.encode(&data) })))
            }
            Request::ChecksumIndex { token, public } => {
                let agent = self.registry.verify_agent_token(&token)?;
                let entries = if public {
                    self.index.snapshot(true, None)
                } else {
                    let username = self
                        .registry
                        .logged_in_user(agent.agent_id)?
                        .ok_or(FleetError::NoUserLoggedIn)?;
                    self.index.snapshot(false, Some(&username))
                };
                Ok(Some(json!({ "entries": entries })))
            }

            // ----------------------------------------------------------
            // Server info
            Request::Info => Ok(Some(json!({
                "software": "fleet-server",
                "version": env!("CARGO_PKG_VERSION"),
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "server_id": self.registry.server_id(),
                "public_key": self.registry.keys().public_key_b64(),
            }))),
        }
    }
}

/// Partition-relative path for an upload: public paths are rooted at the
/// public store, private ones under the uploading user's own segment.
fn scoped_path(public: bool, username: &str, path: &str, name: &str) -> String {
    let rel = if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}/{name}")
    };
    if public {
        rel
    } else {
        format!("{username}/{rel}")
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, FleetError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FleetError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FleetError::Io(std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_paths() {
        assert_eq!(scoped_path(true, "alice", "", "motd.txt"), "motd.txt");
        assert_eq!(
            scoped_path(true, "alice", "etc/banners", "motd.txt"),
            "etc/banners/motd.txt"
        );
        assert_eq!(
            scoped_path(false, "alice", "", "notes.txt"),
            "alice/notes.txt"
        );
        assert_eq!(
            scoped_path(false, "alice", "projects", "notes.txt"),
            "alice/projects/notes.txt"
        );
    }
}
