use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Environment keys whose values never appear in rendered diagnostics.
const REDACTED_ENV_KEYS: &[&str] = &["BORG_PASSPHRASE"];

#[derive(Debug, Error)]
pub enum LastBackupError {
    #[error("unknown interval kind '{0}' (expected one of: yearly, monthly, weekly, daily, hourly)")]
    UnknownIntervalKind(String),

    #[error("missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to load configuration {}: {detail}", path.display())]
    ConfigLoad { path: PathBuf, detail: String },

    #[error("host '{alias}' is not configured in {}", config_path.display())]
    HostNotConfigured { alias: String, config_path: PathBuf },

    #[error("cannot read cache file {}: {detail}", path.display())]
    CacheRead { path: PathBuf, detail: String },

    #[error("archive '{archive}' does not match naming format '{format}'")]
    ArchiveNameMismatch { archive: String, format: String },

    #[error("{0}")]
    CommandExecutionFailed(Box<CommandFailure>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LastBackupError>;

// io::Error is not Clone; the copy keeps its kind and message.
impl Clone for LastBackupError {
    fn clone(&self) -> Self {
        match self {
            Self::UnknownIntervalKind(kind) => Self::UnknownIntervalKind(kind.clone()),
            Self::MissingConfiguration(what) => Self::MissingConfiguration(what.clone()),
            Self::InvalidConfiguration(what) => Self::InvalidConfiguration(what.clone()),
            Self::ConfigLoad { path, detail } => Self::ConfigLoad {
                path: path.clone(),
                detail: detail.clone(),
            },
            Self::HostNotConfigured { alias, config_path } => Self::HostNotConfigured {
                alias: alias.clone(),
                config_path: config_path.clone(),
            },
            Self::CacheRead { path, detail } => Self::CacheRead {
                path: path.clone(),
                detail: detail.clone(),
            },
            Self::ArchiveNameMismatch { archive, format } => Self::ArchiveNameMismatch {
                archive: archive.clone(),
                format: format.clone(),
            },
            Self::CommandExecutionFailed(failure) => Self::CommandExecutionFailed(failure.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Everything an operator needs to rerun a failed external command by hand.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub repository: Option<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandFailure {
    /// Shell-pasteable rendering of env + argv, secrets masked.
    pub fn command_line(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| {
                if REDACTED_ENV_KEYS.contains(&k.as_str()) {
                    format!("{}=<redacted>", k)
                } else {
                    format!("{}={}", k, quote_word(v))
                }
            })
            .collect();
        parts.extend(self.argv.iter().map(|a| quote_word(a)));
        parts.join(" ")
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => writeln!(f, "command failed with exit code {}", code)?,
            None => writeln!(f, "command did not exit normally")?,
        }
        let stdout = self.stdout.trim_end();
        if !stdout.is_empty() {
            writeln!(f, "stdout:\n{}", stdout)?;
        }
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            writeln!(f, "stderr:\n{}", stderr)?;
        }
        if let Some(repo) = &self.repository {
            writeln!(f, "repository: {}", repo)?;
        }
        write!(f, "to reproduce, run:\n  {}", self.command_line())
    }
}

fn quote_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
