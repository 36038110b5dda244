use chrono::{Local, NaiveDateTime};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use super::config::{BackupTarget, Config};
use super::error::Result;
use crate::backends::backup::{
    runner_for, BorgCommands, CommandRunner, ProcessSpawner, SystemSpawner,
};
use crate::handles::automation::backup::staleness::StalenessEngine;
use crate::handles::automation::backup::timestamps::{Resolution, SourceMode, TimestampResolver};
use crate::handles::data::cacheh::{CacheStore, TimestampMap};
use crate::handles::network::neth::ConnectivityProbe;
use crate::handles::network::notify::Notifier;
use crate::handles::network::sshh::HostResolver;
use crate::handles::security::secreth::{CommandSecretSource, SecretSource};

/// Everything one invocation shares: configuration, collaborators and the
/// once-per-process timestamp resolution.
pub struct App {
    pub config: Config,
    mode: SourceMode,
    spawner: Arc<dyn ProcessSpawner>,
    secrets: Arc<dyn SecretSource>,
    probe: ConnectivityProbe,
    cache: CacheStore,
    notifier: Notifier,
    now: Option<NaiveDateTime>,
    resolution: OnceLock<Resolution>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let spawner: Arc<dyn ProcessSpawner> = Arc::new(SystemSpawner);
        let secrets: Arc<dyn SecretSource> =
            Arc::new(CommandSecretSource::new(config.secret_command.clone(), spawner.clone()));
        let probe = ConnectivityProbe::new(HostResolver::new(config.ssh_config_path()))
            .with_retries(config.ping_retries)
            .with_timeout(Duration::from_secs(config.ping_timeout_secs));
        let known = config.ordered_targets().iter().map(|t| t.name.clone()).collect();
        let cache = CacheStore::new(config.cache_path(), known);

        Self {
            config,
            mode: SourceMode::Live,
            spawner,
            secrets,
            probe,
            cache,
            notifier: Notifier::default(),
            now: None,
            resolution: OnceLock::new(),
        }
    }

    pub fn with_mode(mut self, mode: SourceMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretSource>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_probe(mut self, probe: ConnectivityProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Pins the clock; otherwise the local wall clock is read on demand.
    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = Some(now);
        self
    }

    /// Naive local wall clock, the same clock archive names are stamped with.
    pub fn now(&self) -> NaiveDateTime {
        self.now.unwrap_or_else(|| Local::now().naive_local())
    }

    pub fn probe(&self) -> &ConnectivityProbe {
        &self.probe
    }

    pub fn hosts(&self) -> &HostResolver {
        self.probe.hosts()
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn borg(&self) -> BorgCommands {
        BorgCommands::new(self.config.borg.clone())
    }

    pub fn runner_for(&self, target: &BackupTarget) -> Result<CommandRunner<'_>> {
        runner_for(&self.config, target, self.spawner.as_ref(), self.secrets.as_ref())
    }

    /// Runner for hook commands: the target's sudo setting, no passphrase.
    pub fn hook_runner(&self, target: &BackupTarget) -> CommandRunner<'_> {
        CommandRunner::new(self.spawner.as_ref()).with_sudo(target.sudo)
    }

    pub fn resolver(&self) -> TimestampResolver<'_> {
        TimestampResolver::new(
            &self.config,
            &self.probe,
            &self.cache,
            self.spawner.as_ref(),
            self.secrets.as_ref(),
        )
        .with_mode(self.mode)
    }

    /// Resolves every interval on first use; later calls return the same snapshot.
    pub fn resolution(&self) -> &Resolution {
        self.resolution.get_or_init(|| self.resolver().resolve_all())
    }

    pub fn staleness(&self) -> StalenessEngine<'_> {
        StalenessEngine::new(&self.config, self.resolution(), self.now())
    }

    /// Re-resolves from scratch (bypassing the memo) and persists the result.
    ///
    /// Intervals whose destination is unreachable keep their cached value, and
    /// so do intervals that failed to resolve.
    pub fn refresh_cache(&self) -> Result<CacheRefresh> {
        let resolution = self.resolver().resolve_all();
        let mut written = resolution.timestamps();
        if resolution.failures().next().is_some() {
            match self.cache.read_tolerant() {
                Ok(previous) => {
                    for (name, _) in resolution.failures() {
                        if let Some(at) = previous.get(name) {
                            written.insert(name.clone(), *at);
                        }
                    }
                }
                Err(e) => log::warn!("Previous cache entries are lost: {}", e),
            }
        }
        self.cache.write(&written)?;
        Ok(CacheRefresh { written, resolution })
    }
}

/// What `App::refresh_cache` persisted, and the pass it came from.
#[derive(Debug, Clone)]
pub struct CacheRefresh {
    pub written: TimestampMap,
    pub resolution: Resolution,
}
