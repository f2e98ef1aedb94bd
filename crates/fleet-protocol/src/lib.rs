use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Machine-level status an agent reports for itself.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Online,
    Shutdown,
    Sleep,
    Restart,
    Unknown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Online => "online",
            LifecycleState::Shutdown => "shutdown",
            LifecycleState::Sleep => "sleep",
            LifecycleState::Restart => "restart",
            LifecycleState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(LifecycleState::Online),
            "shutdown" => Ok(LifecycleState::Shutdown),
            "sleep" => Ok(LifecycleState::Sleep),
            "restart" => Ok(LifecycleState::Restart),
            "unknown" => Ok(LifecycleState::Unknown),
            other => Err(format!("unknown lifecycle state: {other}")),
        }
    }
}

/// Catalog of remote operations an agent can be asked to run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Update,
    InstallPackage,
    SetTimezone,
    SetHostname,
    DeployScript,
    Shutdown,
    Reboot,
    BroadcastMessage,
    UpdateAgentExecutable,
}

/// State of the operation an agent is (or was last) working on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    InProgress,
    Success,
    Failed,
}

/// One unit of remote work queued for an agent. Immutable once enqueued;
/// sequence numbers are per-agent, assigned at enqueue time, never reused.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Operation {
    pub sequence: u64,
    pub kind: OperationKind,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
}

/// The single per-agent status slot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OperationStatus {
    pub active_sequence: Option<u64>,
    pub state: OperationState,
    pub message: String,
}

impl Default for OperationStatus {
    fn default() -> Self {
        Self {
            active_sequence: None,
            state: OperationState::Idle,
            message: "idle".to_string(),
        }
    }
}

/// Application counters carried in every heartbeat.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateCounters {
    pub updates: i64,
    pub security_updates: i64,
}

/// Per-agent row in the fleet-wide snapshot. Counters, queue length and
/// operation status are only present while the agent holds a live session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentSummary {
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<UpdateCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<OperationStatus>,
}

/// Who last wrote a file in the transfer store.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdatedBy {
    Server,
    Client,
}

/// One checksum-index record as returned to agents.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub store_path: String,
    pub checksum: String,
    pub last_updated_by: UpdatedBy,
}

/// Per-user row in the user listing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserSummary {
    pub admin: bool,
    pub signed_in: bool,
}

/// Client-to-server requests sent as JSON-lines over the TCP socket.
/// Every authenticated request carries its wire token inline.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    // Sessions
    TokenRequest {
        agent_id: Uuid,
        auth: String,
    },
    MgmtTokenRequest {
        username: String,
        password: String,
    },
    MgmtLogout {
        token: String,
    },
    Heartbeat {
        token: String,
        counters: UpdateCounters,
    },
    UpdateState {
        token: String,
        state: LifecycleState,
    },

    // Operations
    GetQueue {
        token: String,
    },
    UpdateStatus {
        token: String,
        sequence: u64,
        state: OperationState,
        #[serde(default)]
        message: String,
    },
    AddOperation {
        token: String,
        targets: Vec<Uuid>,
        kind: OperationKind,
        #[serde(default = "empty_object")]
        payload: serde_json::Value,
    },

    // Queries (management)
    QueryState {
        token: String,
        agent_id: Uuid,
    },
    QueryFleet {
        token: String,
    },
    QueryUsers {
        token: String,
    },

    // Registration and user auth
    RegisterAgent {
        token: String,
    },
    RequestDeployToken {
        token: String,
    },
    DeployJoin {
        token: String,
    },
    RegisterUser {
        token: String,
        username: String,
        password: String,
        #[serde(default)]
        admin: bool,
    },
    Login {
        token: String,
        username: String,
        password: String,
    },
    Logout {
        token: String,
    },

    // File transfer store
    Upload {
        token: String,
        public: bool,
        #[serde(default)]
        path: String,
        name: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Download {
        token: String,
        public: bool,
        path: String,
    },
    ChecksumIndex {
        token: String,
        public: bool,
    },

    // Unauthenticated server info
    Info,
}

/// Server-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

/// Stable error codes for structured rejection handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailure,
    NotFound,
    Conflict,
    ResourceExhausted,
    InvalidRequest,
    Internal,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Base64 encoding for byte arrays in JSON.
pub mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
