//! Control protocol between the supervisor and the host.
//!
//! Both directions are tagged JSON objects, one per line. Inbound messages
//! are [`ControlMessage`]s; everything the host reports is a
//! [`ControlResponse`].

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use termhost_pty::{BackendKind, CapabilityDescriptor, SpawnOptions};

/// Commands sent to the host.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Create {
        id: String,
        #[serde(default)]
        options: CreateOptions,
    },
    Write {
        id: String,
        data: String,
    },
    Resize {
        id: String,
        cols: u16,
        rows: u16,
    },
    Kill {
        id: String,
    },
    List {
        id: String,
    },
}

impl ControlMessage {
    pub fn id(&self) -> &str {
        match self {
            ControlMessage::Create { id, .. }
            | ControlMessage::Write { id, .. }
            | ControlMessage::Resize { id, .. }
            | ControlMessage::Kill { id }
            | ControlMessage::List { id } => id,
        }
    }
}

/// Optional settings for a new session.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct CreateOptions {
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl From<CreateOptions> for SpawnOptions {
    fn from(options: CreateOptions) -> Self {
        SpawnOptions {
            shell: options.shell,
            cwd: options.cwd,
            env: options.env,
            cols: options.cols,
            rows: options.rows,
        }
    }
}

/// Messages sent from the host to the supervisor.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlResponse {
    /// A session is running.
    Created {
        id: String,
        shell: String,
        cwd: String,
        pid: Option<u32>,
        /// Mechanism driving the process, e.g. `portable-pty`.
        strategy: String,
        backend: BackendKind,
        capabilities: CapabilityDescriptor,
        #[serde(rename = "fallbackReason", skip_serializing_if = "Option::is_none")]
        fallback_reason: Option<String>,
    },
    /// One chunk of session output.
    Data {
        id: String,
        data: String,
    },
    /// The process ended on its own.
    Exit {
        id: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    Error {
        id: String,
        error: String,
    },
    Killed {
        id: String,
    },
    List {
        #[serde(rename = "requestId")]
        request_id: String,
        terminals: Vec<TerminalInfo>,
    },
}

impl ControlResponse {
    pub fn error(id: impl Into<String>, error: impl ToString) -> Self {
        ControlResponse::Error {
            id: id.into(),
            error: error.to_string(),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct TerminalInfo {
    pub id: String,
    pub shell: String,
    pub cwd: String,
    pub pid: Option<u32>,
}

/// Parse one inbound line. On failure the returned `error` response carries
/// whatever id could be recovered from the raw JSON.
pub fn parse_control(line: &str) -> Result<ControlMessage, ControlResponse> {
    serde_json::from_str(line).map_err(|e| {
        let id = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|value| value.get("id")?.as_str().map(str::to_string))
            .unwrap_or_default();
        ControlResponse::error(id, format!("invalid control message: {e}"))
    })
}
