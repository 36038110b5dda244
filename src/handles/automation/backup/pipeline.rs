use chrono::NaiveDateTime;
use serde::Serialize;
use std::time::Instant;

use crate::backends::backup::borg::archive_name;
use crate::backends::backup::{split_command_words, BorgCommands, CommandRunner};
use crate::core::config::BackupTarget;
use crate::core::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreHook,
    Create,
    Prune,
    PostHook,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PreHook => "pre_hook",
            Stage::Create => "create",
            Stage::Prune => "prune",
            Stage::PostHook => "post_hook",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub argv: Vec<String>,
    pub duration_ms: u64,
}

/// What a successful run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub target: String,
    pub repository: String,
    pub archive: String,
    pub stages: Vec<StageRecord>,
    pub duration_ms: u64,
}

/// PreHooks, Create, Prune (when rules exist), PostHooks; the first failure aborts the rest.
pub struct BackupPipeline<'a> {
    target: &'a BackupTarget,
    repository: String,
    borg: BorgCommands,
    /// Runs borg; carries sudo and the passphrase.
    runner: &'a CommandRunner<'a>,
    /// Runs hooks; never sees the passphrase.
    hooks: &'a CommandRunner<'a>,
}

impl<'a> BackupPipeline<'a> {
    pub fn new(
        target: &'a BackupTarget,
        repository: impl Into<String>,
        borg: BorgCommands,
        runner: &'a CommandRunner<'a>,
        hooks: &'a CommandRunner<'a>,
    ) -> Self {
        Self {
            target,
            repository: repository.into(),
            borg,
            runner,
            hooks,
        }
    }

    fn timed(
        stages: &mut Vec<StageRecord>,
        stage: Stage,
        argv: Vec<String>,
        f: impl FnOnce(&[String]) -> Result<()>,
    ) -> Result<()> {
        let start = Instant::now();
        log::info!("Stage {:?} argv={:?}", stage, argv);
        f(&argv)?;
        stages.push(StageRecord {
            stage,
            argv,
            duration_ms: start.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    fn run_hooks(&self, stages: &mut Vec<StageRecord>, stage: Stage, hooks: &[String]) -> Result<()> {
        for hook in hooks {
            let argv = split_command_words(hook)?;
            if argv.is_empty() {
                log::warn!("Skipping empty hook in backups.{}", self.target.name);
                continue;
            }
            Self::timed(stages, stage, argv, |argv| self.hooks.capture(argv).map(|_| ()))?;
        }
        Ok(())
    }

    /// `now` stamps the archive name.
    pub fn run(&self, now: &NaiveDateTime) -> Result<RunRecord> {
        let start = Instant::now();
        let archive = archive_name(&self.target.naming_format(), now)?;
        let mut stages = Vec::new();

        self.run_hooks(&mut stages, Stage::PreHook, &self.target.run_before)?;

        let create = self.borg.create(self.target, &self.repository, &archive);
        Self::timed(&mut stages, Stage::Create, create, |argv| self.runner.stream(argv))?;

        if self.target.prune.is_empty() {
            log::debug!("No retention rules for '{}', skipping prune", self.target.name);
        } else {
            let prune = self.borg.prune(&self.target.prune, &self.repository);
            Self::timed(&mut stages, Stage::Prune, prune, |argv| self.runner.stream(argv))?;
        }

        self.run_hooks(&mut stages, Stage::PostHook, &self.target.run_after)?;

        log::info!("Backup '{}' created archive '{}'", self.target.name, archive);
        Ok(RunRecord {
            target: self.target.name.clone(),
            repository: self.repository.clone(),
            archive,
            stages,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
