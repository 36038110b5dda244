use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::config::Destination;
use crate::core::error::{LastBackupError, Result};

/// Options of one `Host` block, keyed by option name as written.
pub type SshHostOptions = BTreeMap<String, String>;

/// Parsed SSH client configuration: alias → options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SshConfig {
    hosts: BTreeMap<String, SshHostOptions>,
}

impl SshConfig {
    /// Parse the subset of ssh_config(5) needed to map aliases to host names.
    ///
    /// Every `Host` line opens a block for each alias it lists; other lines are
    /// `Option value` pairs attached to the current block. Options before the
    /// first `Host` line, `Match` blocks and `Include` directives are ignored.
    pub fn parse(content: &str) -> Self {
        let mut hosts: BTreeMap<String, SshHostOptions> = BTreeMap::new();
        let mut current: Vec<String> = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut parts = trimmed.splitn(2, char::is_whitespace);
            let keyword = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().trim();

            if keyword.eq_ignore_ascii_case("Host") {
                current = value.split_whitespace().map(str::to_string).collect();
                for alias in &current {
                    hosts.entry(alias.clone()).or_default();
                }
                continue;
            }
            if keyword.eq_ignore_ascii_case("Match") {
                current.clear();
                continue;
            }

            for alias in &current {
                if let Some(options) = hosts.get_mut(alias) {
                    // first value wins, as in ssh itself
                    options
                        .entry(keyword.to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
        }

        Self { hosts }
    }

    pub fn host(&self, alias: &str) -> Option<&SshHostOptions> {
        self.hosts.get(alias)
    }

    pub fn option(&self, alias: &str, option: &str) -> Option<&str> {
        self.host(alias)?
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(option))
            .map(|(_, v)| v.as_str())
    }
}

/// Turns a destination into a connectable host name.
#[derive(Debug, Clone)]
pub struct HostResolver {
    config_path: PathBuf,
}

impl HostResolver {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Explicit `host` first, otherwise `HostName` of the alias in `alias:path`.
    pub fn resolve(&self, destination: &Destination) -> Result<String> {
        if let Some(host) = destination.host.as_deref().filter(|h| !h.is_empty()) {
            return Ok(host.to_string());
        }
        let alias = destination
            .remote_parts()
            .map(|(alias, _)| alias)
            .ok_or_else(|| {
                LastBackupError::MissingConfiguration(format!(
                    "host for local destination '{}'",
                    destination.path
                ))
            })?;

        let not_configured = || LastBackupError::HostNotConfigured {
            alias: alias.to_string(),
            config_path: self.config_path.clone(),
        };

        let content = std::fs::read_to_string(&self.config_path).map_err(|e| {
            log::warn!("Cannot read ssh config {}: {}", self.config_path.display(), e);
            not_configured()
        })?;
        let config = SshConfig::parse(&content);
        if config.host(alias).is_none() {
            return Err(not_configured());
        }

        let host = config.option(alias, "HostName").unwrap_or(alias).to_string();
        log::debug!("Resolved ssh alias '{}' to '{}'", alias, host);
        Ok(host)
    }
}
