//! On-disk session representation

use serde::{Deserialize, Serialize};

/// Access mode recorded for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "rw")]
    ReadWrite,
}

/// Contents of one `session-<pid>.json` file
///
/// Unknown keys are rejected; `batch_server` is omitted when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionRecord {
    pub client_pid: i32,
    pub mode: SessionMode,
    pub signals: Vec<String>,
    pub controls: Vec<String>,
    pub watch_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_server: Option<i32>,
}

impl SessionRecord {
    pub fn new(client_pid: i32, signals: Vec<String>, controls: Vec<String>, watch_id: u32) -> Self {
        Self {
            client_pid,
            mode: SessionMode::Read,
            signals,
            controls,
            watch_id,
            batch_server: None,
        }
    }

    /// Parse a session file.
    ///
    /// The document must be a single JSON object; serde would otherwise
    /// accept a positional array for a struct.
    pub fn parse(contents: &str) -> Result<Self, String> {
        let value: serde_json::Value =
            serde_json::from_str(contents).map_err(|e| format!("unable to parse JSON: {}", e))?;
        if !value.is_object() {
            return Err("session file must contain exactly one JSON object".to_string());
        }
        serde_json::from_value(value).map_err(|e| format!("invalid session record: {}", e))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
