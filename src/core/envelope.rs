use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

use super::error::LastBackupError;

/// JSON envelope written by `backup://<name>.run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEnvelope {
    pub ok: bool,
    pub handle: String,
    pub verb: String,
    pub target: String,
    pub ts: String,
    pub duration_ms: u64,
    pub backend: BackendInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub events: Vec<RunEvent>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    pub command: Vec<String>,
    pub env_redacted: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: String,
    pub level: String,
    pub msg: String,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RunEnvelope {
    fn base(verb: &str, target: &str, backend: BackendInfo, duration_ms: u64) -> Self {
        Self {
            ok: true,
            handle: "backup".to_string(),
            verb: verb.to_string(),
            target: target.to_string(),
            ts: Utc::now().to_rfc3339(),
            duration_ms,
            backend,
            result: None,
            events: Vec::new(),
            warnings: Vec::new(),
            error: None,
        }
    }

    pub fn success(
        verb: &str,
        target: &str,
        backend: BackendInfo,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            result: Some(result),
            ..Self::base(verb, target, backend, duration_ms)
        }
    }

    pub fn error(verb: &str, target: &str, backend: BackendInfo, error: RunError, duration_ms: u64) -> Self {
        Self {
            ok: false,
            error: Some(error),
            ..Self::base(verb, target, backend, duration_ms)
        }
    }

    pub fn add_event(&mut self, level: &str, msg: &str, phase: &str) {
        self.events.push(RunEvent {
            ts: Utc::now().to_rfc3339(),
            level: level.to_string(),
            msg: msg.to_string(),
            phase: phase.to_string(),
        });
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn to_json(&self, pretty: bool) -> Result<String> {
        if pretty {
            serde_json::to_string_pretty(self).map_err(|e| anyhow!("JSON serialization error: {}", e))
        } else {
            serde_json::to_string(self).map_err(|e| anyhow!("JSON serialization error: {}", e))
        }
    }
}

impl BackendInfo {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            repository: None,
            command: Vec::new(),
            env_redacted: BTreeMap::new(),
        }
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn set_command(&mut self, command: Vec<String>) {
        self.command = command;
    }

    pub fn set_env(&mut self, env: &BTreeMap<String, String>) {
        self.env_redacted = redact_env_vars(env);
    }
}

/// Tail kept from a failed command's stderr.
const ERROR_TAIL_SIZE: usize = 8 * 1024;

fn tail(text: &str) -> String {
    if text.len() <= ERROR_TAIL_SIZE {
        return text.to_string();
    }
    let mut start = text.len() - ERROR_TAIL_SIZE;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

impl RunError {
    pub fn new(kind: &str, message: &str) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.to_string(),
            details: None,
        }
    }

    pub fn from_error(err: &LastBackupError) -> Self {
        let kind = match err {
            LastBackupError::UnknownIntervalKind(_)
            | LastBackupError::MissingConfiguration(_)
            | LastBackupError::InvalidConfiguration(_)
            | LastBackupError::ConfigLoad { .. } => "config",
            LastBackupError::HostNotConfigured { .. } => "host_not_configured",
            LastBackupError::CacheRead { .. } => "cache_read",
            LastBackupError::ArchiveNameMismatch { .. } => "archive_name",
            LastBackupError::CommandExecutionFailed(_) => "command_failed",
            LastBackupError::Io(_) => "io",
        };

        match err {
            LastBackupError::CommandExecutionFailed(f) => Self {
                kind: kind.to_string(),
                message: match f.exit_code {
                    Some(code) => format!("command exited with code {}", code),
                    None => "command did not exit normally".to_string(),
                },
                details: Some(serde_json::json!({
                    "exit_code": f.exit_code,
                    "repository": f.repository,
                    "command": f.command_line(),
                    "stderr_tail": tail(&f.stderr),
                })),
            },
            other => Self::new(kind, &other.to_string()),
        }
    }
}

/// Masks values of secret-looking variables.
pub fn redact_env_vars(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    const SENSITIVE: &[&str] = &["PASSWORD", "SECRET", "TOKEN", "PASSPHRASE", "KEY"];

    env.iter()
        .map(|(key, value)| {
            let upper = key.to_uppercase();
            if SENSITIVE.iter().any(|s| upper.contains(s)) {
                (key.clone(), "***REDACTED***".to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

pub struct Timer {
    start: SystemTime,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: SystemTime::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().unwrap_or_default().as_millis() as u64
    }
}
