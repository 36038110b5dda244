use chrono::NaiveDateTime;
use std::fmt::Write as _;

use crate::core::config::BackupTarget;
use crate::core::error::{LastBackupError, Result};
use crate::handles::automation::backup::intervals::parse_lenient;
use crate::handles::automation::backup::policy::RetentionPolicy;

/// Builds borg argument vectors.
#[derive(Debug, Clone)]
pub struct BorgCommands {
    binary: String,
}

impl Default for BorgCommands {
    fn default() -> Self {
        Self::new("borg")
    }
}

impl BorgCommands {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn base(&self, subcommand: &str) -> Vec<String> {
        vec![self.binary.clone(), subcommand.to_string()]
    }

    /// `borg list --last 1 <repo>`: one line, newest archive first token.
    pub fn list_latest(&self, repo: &str) -> Vec<String> {
        let mut argv = self.base("list");
        argv.extend(["--last".to_string(), "1".to_string(), repo.to_string()]);
        argv
    }

    /// `borg create -C <c> [--exclude p]... [--exclude-if-present p]... [--flag]... repo::name src...`
    pub fn create(&self, target: &BackupTarget, repo: &str, archive_name: &str) -> Vec<String> {
        let mut argv = self.base("create");
        argv.push("-C".to_string());
        argv.push(target.compression.clone());

        for pattern in &target.exclude {
            argv.push("--exclude".to_string());
            argv.push(pattern.clone());
        }
        for pattern in &target.exclude_if_present {
            argv.push("--exclude-if-present".to_string());
            argv.push(pattern.clone());
        }
        for flag in &target.flags {
            argv.push(format!("--{}", flag.trim_start_matches('-')));
        }

        argv.push(format!("{}::{}", repo, archive_name));
        argv.extend(target.sources.iter().cloned());
        argv
    }

    /// `borg prune --keep-<kind> <n>... <repo>`
    pub fn prune(&self, policy: &RetentionPolicy, repo: &str) -> Vec<String> {
        let mut argv = self.base("prune");
        argv.extend(policy.to_borg_args());
        argv.push(repo.to_string());
        argv
    }
}

/// Archive name token of the last non-empty line of `borg list` output.
pub fn latest_archive_name(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| l.split_whitespace().next())
}

/// Formats a new archive name; invalid format strings are a configuration error.
pub fn archive_name(naming_format: &str, now: &NaiveDateTime) -> Result<String> {
    let mut name = String::new();
    write!(name, "{}", now.format(naming_format)).map_err(|_| {
        LastBackupError::InvalidConfiguration(format!("invalid naming format '{}'", naming_format))
    })?;
    Ok(name)
}

pub fn parse_archive_time(archive: &str, naming_format: &str) -> Result<NaiveDateTime> {
    parse_lenient(archive, naming_format).map_err(|_| LastBackupError::ArchiveNameMismatch {
        archive: archive.to_string(),
        format: naming_format.to_string(),
    })
}
