use fleet_protocol::ErrorCode;
use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("agent not registered: {0}")]
    AgentNotRegistered(Uuid),

    #[error("auth secret mismatch")]
    AuthMismatch,

    #[error("session already issued for agent {0}")]
    SessionAlreadyIssued(Uuid),

    #[error("management session already active from {0}")]
    AlreadyLoggedInFromIp(String),

    #[error("no active session for agent {0}")]
    NoActiveSession(Uuid),

    #[error("token expired or not valid")]
    TokenRejected,

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("password mismatch")]
    PasswordMismatch,

    #[error("username taken: {0}")]
    UsernameTaken(String),

    #[error("username not allowed: {0}")]
    InvalidUsername(String),

    #[error("user {username} is already logged in on agent {agent_id}")]
    UserAlreadyLoggedIn { agent_id: Uuid, username: String },

    #[error("no user logged in on this agent")]
    NoUserLoggedIn,

    #[error("user {0} is not an administrator")]
    NotAdmin(String),

    #[error("operation queue full for agent {0}")]
    QueueFull(Uuid),

    #[error("operation kind is disabled on this server: {0}")]
    OperationDisabled(&'static str),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("path not allowed: {0}")]
    InvalidPath(String),

    #[error("insufficient space: need {needed} bytes, {free} usable")]
    InsufficientSpace { needed: u64, free: u64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("token error: {0}")]
    Token(#[from] fleet_crypto::token::TokenError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            FleetError::AuthMismatch
            | FleetError::PasswordMismatch
            | FleetError::TokenRejected
            | FleetError::NotAdmin(_)
            | FleetError::Token(_) => (ErrorCode::AuthFailure, self.to_string()),
            FleetError::AgentNotRegistered(_)
            | FleetError::UserNotFound(_)
            | FleetError::FileNotFound(_) => (ErrorCode::NotFound, self.to_string()),
            FleetError::SessionAlreadyIssued(_)
            | FleetError::AlreadyLoggedInFromIp(_)
            | FleetError::UsernameTaken(_)
            | FleetError::UserAlreadyLoggedIn { .. }
            | FleetError::OperationDisabled(_) => (ErrorCode::Conflict, self.to_string()),
            FleetError::QueueFull(_) | FleetError::InsufficientSpace { .. } => {
                (ErrorCode::ResourceExhausted, self.to_string())
            }
            FleetError::NoActiveSession(_)
            | FleetError::NoUserLoggedIn
            | FleetError::InvalidUsername(_)
            | FleetError::InvalidPath(_) => (ErrorCode::InvalidRequest, self.to_string()),
            FleetError::Store(_) => (ErrorCode::Internal, "internal storage error".to_string()),
            FleetError::Io(_) => (ErrorCode::Internal, "internal I/O error".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_sanitized() {
        let err = FleetError::Store(StoreError::Backend("users.db is corrupt at page 7".into()));
        let (code, msg) = err.to_error_code();
        assert_eq!(code, ErrorCode::Internal);
        assert!(!msg.contains("users.db"));
    }

    #[test]
    fn auth_class_maps_to_auth_failure() {
        for err in [
            FleetError::AuthMismatch,
            FleetError::TokenRejected,
            FleetError::NotAdmin("carol".into()),
        ] {
            assert_eq!(err.to_error_code().0, ErrorCode::AuthFailure);
        }
    }

    #[test]
    fn exhaustion_class() {
        let (code, _) = FleetError::QueueFull(Uuid::new_v4()).to_error_code();
        assert_eq!(code, ErrorCode::ResourceExhausted);
        let (code, _) = FleetError::InsufficientSpace { needed: 10, free: 1 }.to_error_code();
        assert_eq!(code, ErrorCode::ResourceExhausted);
    }
}
