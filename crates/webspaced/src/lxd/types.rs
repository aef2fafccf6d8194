//! LXD REST API types.
//!
//! Only the fields webspaced reads or writes are modelled; everything else
//! LXD sends is ignored on the way in and left at its default on the way out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// LXD status code for a running instance.
pub const STATUS_RUNNING: i64 = 103;

/// LXD status code for a stopped instance.
pub const STATUS_STOPPED: i64 = 102;

/// LXD status code at and above which an operation is considered failed.
const STATUS_FAILURE: i64 = 400;

/// Top-level envelope of every LXD response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Writable part of an instance record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstancePut {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub description: String,
}

/// Full instance record as returned by `GET /1.0/instances/<name>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(flatten)]
    pub put: InstancePut,
}

/// Image source for instance creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl InstanceSource {
    /// Build an image source from either an alias or a fingerprint.
    ///
    /// Anything made only of hex digits and at least 12 characters long is
    /// treated as a fingerprint, which matches how LXD abbreviates them.
    pub fn image(image: &str) -> Self {
        let is_fingerprint = image.len() >= 12 && image.chars().all(|c| c.is_ascii_hexdigit());
        Self {
            kind: "image".to_string(),
            alias: (!is_fingerprint).then(|| image.to_string()),
            fingerprint: is_fingerprint.then(|| image.to_string()),
        }
    }
}

/// Body of `POST /1.0/instances`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancesPost {
    pub name: String,
    pub source: InstanceSource,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub put: InstancePut,
}

impl InstancesPost {
    /// Create a container from an image alias or fingerprint.
    pub fn container(name: impl Into<String>, image: &str, put: InstancePut) -> Self {
        Self {
            name: name.into(),
            source: InstanceSource::image(image),
            kind: "container".to_string(),
            put,
        }
    }
}

/// State change actions accepted by `PUT /1.0/instances/<name>/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Start,
    Stop,
    Restart,
}

impl std::fmt::Display for StateAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateAction::Start => write!(f, "start"),
            StateAction::Stop => write!(f, "stop"),
            StateAction::Restart => write!(f, "restart"),
        }
    }
}

/// Body of `PUT /1.0/instances/<name>/state`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatePut {
    pub action: StateAction,
    pub timeout: i64,
    pub force: bool,
    pub stateful: bool,
}

impl InstanceStatePut {
    pub fn new(action: StateAction) -> Self {
        Self {
            action,
            timeout: -1,
            force: false,
            stateful: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStateCpu {
    #[serde(default)]
    pub usage: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStateMemory {
    #[serde(default)]
    pub usage: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStateDisk {
    /// Bytes used, or -1 when the storage driver cannot report it.
    #[serde(default)]
    pub usage: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStateNetworkAddress {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStateNetworkCounters {
    #[serde(default)]
    pub bytes_received: i64,
    #[serde(default)]
    pub bytes_sent: i64,
    #[serde(default)]
    pub packets_received: i64,
    #[serde(default)]
    pub packets_sent: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStateNetwork {
    #[serde(default)]
    pub addresses: Vec<InstanceStateNetworkAddress>,
    #[serde(default)]
    pub counters: InstanceStateNetworkCounters,
    #[serde(default)]
    pub hwaddr: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub mtu: i64,
    #[serde(default)]
    pub state: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Runtime state as returned by `GET /1.0/instances/<name>/state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub cpu: InstanceStateCpu,
    #[serde(default)]
    pub memory: InstanceStateMemory,
    #[serde(default)]
    pub disk: HashMap<String, InstanceStateDisk>,
    #[serde(default)]
    pub network: Option<HashMap<String, InstanceStateNetwork>>,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub processes: i64,
}

impl InstanceState {
    pub fn is_running(&self) -> bool {
        self.status_code == STATUS_RUNNING
    }
}

/// Body of `POST /1.0/instances/<name>/exec`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceExecPost {
    pub command: Vec<String>,
    pub environment: HashMap<String, String>,
    #[serde(rename = "wait-for-websocket")]
    pub wait_for_websocket: bool,
    #[serde(rename = "record-output")]
    pub record_output: bool,
    pub interactive: bool,
    /// Terminal size of an interactive command. 0 lets LXD pick.
    pub width: u32,
    pub height: u32,
}

impl InstanceExecPost {
    /// Non-interactive command whose output LXD records to log files.
    pub fn recorded(command: Vec<String>) -> Self {
        Self {
            command,
            environment: HashMap::new(),
            wait_for_websocket: false,
            record_output: true,
            interactive: false,
            width: 0,
            height: 0,
        }
    }

    /// Command attached to a terminal, driven over websockets.
    pub fn interactive(
        command: Vec<String>,
        environment: HashMap<String, String>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            command,
            environment,
            wait_for_websocket: true,
            record_output: false,
            interactive: true,
            width,
            height,
        }
    }
}

/// Out-of-band message for a running interactive command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecControl {
    Resize { width: u32, height: u32 },
    Signal(i32),
}

/// Wire form of [`ExecControl`] on the exec control websocket.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceExecControl {
    pub command: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl From<ExecControl> for InstanceExecControl {
    fn from(control: ExecControl) -> Self {
        match control {
            ExecControl::Resize { width, height } => Self {
                command: "window-resize".to_string(),
                args: HashMap::from([
                    ("width".to_string(), width.to_string()),
                    ("height".to_string(), height.to_string()),
                ]),
                signal: None,
            },
            ExecControl::Signal(signal) => Self {
                command: "signal".to_string(),
                args: HashMap::new(),
                signal: Some(signal),
            },
        }
    }
}

/// Result of a recorded exec: log file names for stdout/stderr plus exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub stdout_log: String,
    pub stderr_log: String,
    pub exit_code: i64,
}

/// Background operation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub err: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl Operation {
    pub fn failed(&self) -> bool {
        self.status_code >= STATUS_FAILURE
    }
}

/// Event delivered on `/1.0/events`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}
