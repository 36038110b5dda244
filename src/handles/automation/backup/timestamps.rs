use chrono::NaiveDateTime;
use std::cell::{OnceCell, RefCell};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::intervals::never_executed_sentinel;
use crate::backends::backup::borg::{latest_archive_name, parse_archive_time};
use crate::backends::backup::{runner_for, BorgCommands, ProcessSpawner};
use crate::core::config::{BackupTarget, Config};
use crate::core::error::{LastBackupError, Result};
use crate::handles::data::cacheh::{CacheStore, TimestampMap};
use crate::handles::network::neth::ConnectivityProbe;
use crate::handles::security::secreth::SecretSource;

/// Where timestamps may come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceMode {
    /// Ask the repository when its destination is reachable, else the cache.
    #[default]
    Live,
    /// Never touch the network.
    Cached,
}

impl FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "live" => Ok(SourceMode::Live),
            "cached" | "cache" => Ok(SourceMode::Cached),
            other => Err(format!("unknown source '{}', expected live or cached", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampSource {
    Live,
    Cached,
}

impl fmt::Display for TimestampSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimestampSource::Live => "live",
            TimestampSource::Cached => "cached",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTimestamp {
    pub at: NaiveDateTime,
    pub source: TimestampSource,
}

/// Best available timestamp of every configured interval.
///
/// An interval that failed to resolve keeps its error; only queries about
/// that interval see it.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    entries: BTreeMap<String, Result<ResolvedTimestamp>>,
}

impl Resolution {
    pub fn insert(&mut self, name: impl Into<String>, resolved: ResolvedTimestamp) {
        self.entries.insert(name.into(), Ok(resolved));
    }

    pub fn insert_failure(&mut self, name: impl Into<String>, err: LastBackupError) {
        self.entries.insert(name.into(), Err(err));
    }

    pub fn get(&self, name: &str) -> Result<&ResolvedTimestamp> {
        match self.entries.get(name) {
            Some(Ok(resolved)) => Ok(resolved),
            Some(Err(e)) => Err(e.clone()),
            None => Err(LastBackupError::MissingConfiguration(format!(
                "backups.{} (not resolved)",
                name
            ))),
        }
    }

    /// Intervals that resolved.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResolvedTimestamp)> {
        self.entries
            .iter()
            .filter_map(|(name, r)| r.as_ref().ok().map(|r| (name, r)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&String, &LastBackupError)> {
        self.entries
            .iter()
            .filter_map(|(name, r)| r.as_ref().err().map(|e| (name, e)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain name → timestamp mapping of the resolved intervals, the shape the
    /// cache file stores.
    pub fn timestamps(&self) -> TimestampMap {
        self.iter().map(|(k, v)| (k.clone(), v.at)).collect()
    }
}

/// Picks between repository introspection and the cache, per interval.
///
/// One resolver is one pass: each destination is probed at most once and the
/// cache file is read at most once.
pub struct TimestampResolver<'a> {
    config: &'a Config,
    probe: &'a ConnectivityProbe,
    cache: &'a CacheStore,
    spawner: &'a dyn ProcessSpawner,
    secrets: &'a dyn SecretSource,
    mode: SourceMode,
    reachable: RefCell<BTreeMap<String, Result<bool>>>,
    cached: OnceCell<Result<TimestampMap>>,
}

impl<'a> TimestampResolver<'a> {
    pub fn new(
        config: &'a Config,
        probe: &'a ConnectivityProbe,
        cache: &'a CacheStore,
        spawner: &'a dyn ProcessSpawner,
        secrets: &'a dyn SecretSource,
    ) -> Self {
        Self {
            config,
            probe,
            cache,
            spawner,
            secrets,
            mode: SourceMode::Live,
            reachable: RefCell::new(BTreeMap::new()),
            cached: OnceCell::new(),
        }
    }

    pub fn with_mode(mut self, mode: SourceMode) -> Self {
        self.mode = mode;
        self
    }

    fn borg(&self) -> BorgCommands {
        BorgCommands::new(self.config.borg.clone())
    }

    /// Newest archive timestamp straight from the repository.
    ///
    /// Callers check reachability first. An empty repository yields the sentinel.
    pub fn resolve_live(&self, target: &BackupTarget) -> Result<NaiveDateTime> {
        let repo = self.config.repository_for(target)?;
        let runner = runner_for(self.config, target, self.spawner, self.secrets)?;
        let stdout = runner.capture(&self.borg().list_latest(&repo))?;

        match latest_archive_name(&stdout) {
            Some(archive) => {
                let at = parse_archive_time(archive, &target.naming_format())?;
                log::debug!("Live timestamp name='{}' archive='{}' at={}", target.name, archive, at);
                Ok(at)
            }
            None => {
                log::info!("Repository {} has no archives yet", repo);
                Ok(never_executed_sentinel())
            }
        }
    }

    /// Cache entry for `name`, or the sentinel when the file or the entry is absent.
    pub fn resolve_cached(&self, name: &str) -> Result<NaiveDateTime> {
        let snapshot = self.cached.get_or_init(|| self.cache.read_tolerant());
        match snapshot {
            Ok(entries) => Ok(entries.get(name).copied().unwrap_or_else(never_executed_sentinel)),
            Err(e) => Err(e.clone()),
        }
    }

    fn live_allowed(&self, target: &BackupTarget) -> Result<bool> {
        if self.mode == SourceMode::Cached {
            return Ok(false);
        }
        let known = self.reachable.borrow().get(&target.destination).cloned();
        if let Some(known) = known {
            return known;
        }

        let up = self
            .config
            .destination_for(target)
            .and_then(|dest| self.probe.is_reachable(dest));
        match &up {
            Ok(up) => log::info!("Destination '{}' reachable={}", target.destination, up),
            Err(e) => log::warn!("Destination '{}' cannot be probed: {}", target.destination, e),
        }
        self.reachable
            .borrow_mut()
            .insert(target.destination.clone(), up.clone());
        up
    }

    /// One interval, live when its destination answers.
    pub fn resolve(&self, name: &str) -> Result<ResolvedTimestamp> {
        let target = self.config.target(name)?;
        if self.live_allowed(target)? {
            return Ok(ResolvedTimestamp {
                at: self.resolve_live(target)?,
                source: TimestampSource::Live,
            });
        }
        Ok(ResolvedTimestamp {
            at: self.resolve_cached(name)?,
            source: TimestampSource::Cached,
        })
    }

    /// Every configured interval. A failure is recorded against its interval
    /// and does not stop the others.
    pub fn resolve_all(&self) -> Resolution {
        let mut resolution = Resolution::default();
        for target in self.config.ordered_targets() {
            match self.resolve(&target.name) {
                Ok(resolved) => resolution.insert(target.name.clone(), resolved),
                Err(e) => {
                    log::warn!("Cannot resolve last backup of '{}': {}", target.name, e);
                    resolution.insert_failure(target.name.clone(), e);
                }
            }
        }
        resolution
    }
}
