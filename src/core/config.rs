use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backends::backup::split_command_words;
use crate::core::error::{LastBackupError, Result};
use crate::handles::automation::backup::intervals::IntervalKind;
use crate::handles::automation::backup::policy::RetentionPolicy;

pub const CONFIG_ROOT_ENV: &str = "XDG_CONFIG_HOME";
const APP_DIR: &str = "lastbackup";
const CONFIG_FILE: &str = "config.yml";
const CACHE_FILE: &str = ".lastbackups";
const RESERVED_TARGET_NAME: &str = "all";

/// Top-level YAML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub backups: BTreeMap<String, BackupTarget>,
    #[serde(default)]
    pub destinations: BTreeMap<String, Destination>,
    /// SSH client configuration consulted for host aliases.
    #[serde(default)]
    pub ssh_config: Option<PathBuf>,
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
    #[serde(default = "default_ping_retries")]
    pub ping_retries: u32,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_borg")]
    pub borg: String,
    /// Secret lookup command; the entry name is appended as last argument.
    #[serde(default = "default_secret_command")]
    pub secret_command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupTarget {
    /// Filled from the map key after loading.
    #[serde(skip)]
    pub name: String,
    /// Interval kind name; the backup name is used when absent.
    #[serde(default)]
    pub interval: Option<String>,
    pub destination: String,
    pub repo: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub naming_format: Option<String>,
    #[serde(default)]
    pub sudo: bool,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub exclude_if_present: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub prune: RetentionPolicy,
    #[serde(default)]
    pub run_before: Vec<String>,
    #[serde(default)]
    pub run_after: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Destination {
    /// Local directory, or `alias:path` for a remote repository.
    pub path: String,
    #[serde(default)]
    pub host: Option<String>,
    /// VPN configuration whose interface must be up before probing the host.
    #[serde(default)]
    pub vpn: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub notification_port: Option<u16>,
    #[serde(default)]
    pub passphrase_entry: Option<String>,
}

fn default_ping_retries() -> u32 {
    1
}

fn default_ping_timeout_secs() -> u64 {
    1
}

fn default_borg() -> String {
    "borg".to_string()
}

fn default_secret_command() -> Vec<String> {
    vec!["pass".to_string(), "show".to_string()]
}

fn default_compression() -> String {
    "lz4".to_string()
}

impl Config {
    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(text).map_err(|e| LastBackupError::ConfigLoad {
                path: origin.to_path_buf(),
                detail: e.to_string(),
            })?;
        for (name, target) in config.backups.iter_mut() {
            target.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        log::debug!("Loading configuration from {}", path.display());
        let text = fs::read_to_string(path).map_err(|e| LastBackupError::ConfigLoad {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Self::from_yaml(&text, path)
    }

    /// Fails fast on anything that would break an interval operation later.
    pub fn validate(&self) -> Result<()> {
        if self.backups.is_empty() {
            return Err(LastBackupError::MissingConfiguration(
                "no backups configured".to_string(),
            ));
        }
        for target in self.backups.values() {
            if target.name == RESERVED_TARGET_NAME {
                return Err(LastBackupError::InvalidConfiguration(format!(
                    "backups.{}: name is reserved for addressing every interval",
                    target.name
                )));
            }
            target.kind()?;
            let format = target.naming_format();
            if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
                return Err(LastBackupError::InvalidConfiguration(format!(
                    "backups.{}.naming_format: invalid format '{}'",
                    target.name, format
                )));
            }
            if !self.destinations.contains_key(&target.destination) {
                return Err(LastBackupError::MissingConfiguration(format!(
                    "destinations.{} (referenced by backups.{})",
                    target.destination, target.name
                )));
            }
            if target.repo.trim().is_empty() {
                return Err(LastBackupError::MissingConfiguration(format!(
                    "backups.{}.repo",
                    target.name
                )));
            }
            for hook in target.run_before.iter().chain(&target.run_after) {
                split_command_words(hook).map_err(|e| match e {
                    LastBackupError::InvalidConfiguration(detail) => {
                        LastBackupError::InvalidConfiguration(format!("backups.{}: {}", target.name, detail))
                    }
                    other => other,
                })?;
            }
            target.prune.validate().map_err(|e| {
                LastBackupError::InvalidConfiguration(format!("backups.{}.prune: {}", target.name, e))
            })?;
        }
        Ok(())
    }

    pub fn target(&self, name: &str) -> Result<&BackupTarget> {
        self.backups
            .get(name)
            .ok_or_else(|| LastBackupError::MissingConfiguration(format!("backups.{}", name)))
    }

    pub fn destination(&self, key: &str) -> Result<&Destination> {
        self.destinations
            .get(key)
            .ok_or_else(|| LastBackupError::MissingConfiguration(format!("destinations.{}", key)))
    }

    pub fn destination_for(&self, target: &BackupTarget) -> Result<&Destination> {
        self.destination(&target.destination)
    }

    /// Configured targets in catalog order (coarsest interval first), then by name.
    pub fn ordered_targets(&self) -> Vec<&BackupTarget> {
        let mut targets: Vec<&BackupTarget> = self.backups.values().collect();
        targets.sort_by_key(|t| (t.kind().ok(), t.name.clone()));
        targets
    }

    pub fn repository_for(&self, target: &BackupTarget) -> Result<String> {
        let dest = self.destination_for(target)?;
        Ok(dest.repository(&target.repo))
    }

    pub fn ssh_config_path(&self) -> PathBuf {
        self.ssh_config
            .clone()
            .unwrap_or_else(|| home_dir().join(".ssh").join("config"))
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_file
            .clone()
            .unwrap_or_else(|| home_dir().join(CACHE_FILE))
    }
}

impl BackupTarget {
    pub fn kind(&self) -> Result<IntervalKind> {
        self.interval.as_deref().unwrap_or(&self.name).parse()
    }

    pub fn naming_format(&self) -> String {
        self.naming_format
            .clone()
            .unwrap_or_else(|| format!("{}-%Y-%m-%dT%H:%M:%S", self.name))
    }
}

impl Destination {
    pub fn is_remote(&self) -> bool {
        self.remote_parts().is_some()
    }

    /// `(alias, path)` for an `alias:path` destination.
    pub fn remote_parts(&self) -> Option<(&str, &str)> {
        let (alias, path) = self.path.split_once(':')?;
        if alias.is_empty() || alias.contains('/') {
            return None;
        }
        Some((alias, path))
    }

    pub fn repository(&self, repo_dir: &str) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), repo_dir)
    }

    pub fn passphrase_entry(&self, key: &str) -> String {
        self.passphrase_entry
            .clone()
            .unwrap_or_else(|| format!("borg/{}", key))
    }
}

pub fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/root"))
}

/// `$XDG_CONFIG_HOME/lastbackup/config.yml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let root = std::env::var(CONFIG_ROOT_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| home_dir().join(".config"));
    root.join(APP_DIR).join(CONFIG_FILE)
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = r#"
backups:
  daily:
    destination: nas
    repo: daily
    sources: [/home/me, /etc]
    exclude: ["*/.cache"]
    exclude_if_present: [.nobackup]
    flags: [one-file-system]
    prune:
      keep-daily: 7
    run_before: ["mount /mnt/nas"]
    run_after: ["umount /mnt/nas"]
  weekly:
    destination: offsite
    repo: weekly
    sources: [/home/me]
    sudo: true
destinations:
  nas:
    path: /mnt/nas/borg
  offsite:
    path: vault:/srv/borg
    vpn: wg-home
    encrypted: true
    notification_port: 4040
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config::from_yaml(SAMPLE_CONFIG, Path::new("test.yml")).unwrap()
    }

    #[test]
    fn test_load_sample() {
        let config = sample();
        let daily = config.target("daily").unwrap();
        assert_eq!(daily.name, "daily");
        assert_eq!(daily.kind().unwrap(), IntervalKind::Daily);
        assert_eq!(daily.compression, "lz4");
        assert_eq!(daily.sources, vec!["/home/me", "/etc"]);
        assert_eq!(daily.prune.get("keep-daily"), Some(7));
        assert_eq!(config.ping_retries, 1);
        assert_eq!(config.borg, "borg");
        assert_eq!(config.repository_for(daily).unwrap(), "/mnt/nas/borg/daily");
    }

    #[test]
    fn test_remote_destination() {
        let config = sample();
        let offsite = config.destination("offsite").unwrap();
        assert!(offsite.is_remote());
        assert_eq!(offsite.remote_parts(), Some(("vault", "/srv/borg")));
        assert_eq!(offsite.repository("weekly"), "vault:/srv/borg/weekly");
        assert_eq!(offsite.passphrase_entry("offsite"), "borg/offsite");
        assert!(!config.destination("nas").unwrap().is_remote());
    }

    #[test]
    fn test_missing_destination_is_rejected() {
        let yaml = "backups:\n  daily:\n    destination: nowhere\n    repo: daily\n";
        let err = Config::from_yaml(yaml, Path::new("x.yml")).unwrap_err();
        assert!(matches!(err, LastBackupError::MissingConfiguration(ref m) if m.contains("nowhere")));
    }

    #[test]
    fn test_unknown_interval_kind_is_rejected() {
        let yaml = "backups:\n  nightly:\n    destination: nas\n    repo: n\ndestinations:\n  nas:\n    path: /srv\n";
        let err = Config::from_yaml(yaml, Path::new("x.yml")).unwrap_err();
        assert!(matches!(err, LastBackupError::UnknownIntervalKind(ref k) if k == "nightly"));
    }

    #[test]
    fn test_explicit_interval_kind() {
        let yaml = "backups:\n  nightly:\n    interval: daily\n    destination: nas\n    repo: n\ndestinations:\n  nas:\n    path: /srv\n";
        let config = Config::from_yaml(yaml, Path::new("x.yml")).unwrap();
        assert_eq!(config.target("nightly").unwrap().kind().unwrap(), IntervalKind::Daily);
        assert_eq!(
            config.target("nightly").unwrap().naming_format(),
            "nightly-%Y-%m-%dT%H:%M:%S"
        );
    }

    #[test]
    fn test_invalid_naming_format_is_rejected() {
        let yaml = "backups:\n  daily:\n    naming_format: 'daily-%Q'\n    destination: nas\n    repo: d\ndestinations:\n  nas:\n    path: /srv\n";
        let err = Config::from_yaml(yaml, Path::new("x.yml")).unwrap_err();
        assert!(matches!(err, LastBackupError::InvalidConfiguration(ref m) if m.contains("naming_format")));
    }

    #[test]
    fn test_reserved_name_is_rejected() {
        let yaml = "backups:\n  all:\n    interval: daily\n    destination: nas\n    repo: a\ndestinations:\n  nas:\n    path: /srv\n";
        let err = Config::from_yaml(yaml, Path::new("x.yml")).unwrap_err();
        assert!(matches!(err, LastBackupError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_unterminated_hook_quote_is_rejected() {
        let yaml = "backups:\n  daily:\n    destination: nas\n    repo: d\n    run_after: [\"echo 'abc\"]\ndestinations:\n  nas:\n    path: /srv\n";
        let err = Config::from_yaml(yaml, Path::new("x.yml")).unwrap_err();
        assert!(matches!(err, LastBackupError::InvalidConfiguration(ref m) if m.starts_with("backups.daily: unterminated")));
    }

    #[test]
    fn test_empty_config_is_rejected() {
        let err = Config::from_yaml("{}", Path::new("x.yml")).unwrap_err();
        assert!(matches!(err, LastBackupError::MissingConfiguration(_)));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = Config::from_yaml("backups: [", Path::new("broken.yml")).unwrap_err();
        assert!(matches!(err, LastBackupError::ConfigLoad { .. }));
    }

    #[test]
    fn test_ordered_targets_follow_catalog() {
        let config = sample();
        let names: Vec<&str> = config.ordered_targets().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["weekly", "daily"]);
    }
}
