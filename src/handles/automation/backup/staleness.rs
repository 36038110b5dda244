use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;

use super::intervals::{is_sentinel, IntervalDefinition, IntervalKind};
use super::timestamps::{Resolution, TimestampSource};
use crate::core::config::{BackupTarget, Config};
use crate::core::error::{LastBackupError, Result};
use crate::handles::data::cacheh::CACHE_TIME_FORMAT;

/// Whole interval units between `last` (coarsened to the interval's
/// granularity) and `now`, truncated toward zero.
pub fn age_in_units_at(
    definition: &IntervalDefinition,
    last: &NaiveDateTime,
    now: &NaiveDateTime,
) -> Result<i64> {
    let coarse = definition.coarsen(last).map_err(|e| {
        LastBackupError::InvalidConfiguration(format!(
            "cannot coarsen {} with '{}': {}",
            last,
            definition.effective_coarsening_format(),
            e
        ))
    })?;
    let elapsed = now.signed_duration_since(coarse).num_seconds();
    Ok(elapsed / definition.unit_seconds)
}

/// Everything shown for one interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalReport {
    pub name: String,
    pub repo: String,
    pub kind: IntervalKind,
    pub last: String,
    pub label: String,
    pub age: i64,
    pub unit: String,
    pub stale: bool,
    pub never_executed: bool,
    pub source: TimestampSource,
}

impl fmt::Display for IntervalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.never_executed {
            return write!(f, "{}: never executed", self.name);
        }
        write!(
            f,
            "{}: last {} ({}), {} {} ago",
            self.name, self.last, self.label, self.age, self.unit
        )?;
        if self.stale {
            f.write_str(", stale")?;
        }
        Ok(())
    }
}

/// Pure classification over an already resolved snapshot.
pub struct StalenessEngine<'a> {
    config: &'a Config,
    resolution: &'a Resolution,
    now: NaiveDateTime,
}

impl<'a> StalenessEngine<'a> {
    pub fn new(config: &'a Config, resolution: &'a Resolution, now: NaiveDateTime) -> Self {
        Self {
            config,
            resolution,
            now,
        }
    }

    fn last(&self, name: &str) -> Result<NaiveDateTime> {
        Ok(self.resolution.get(name)?.at)
    }

    pub fn age_in_units(&self, name: &str) -> Result<i64> {
        let kind = self.config.target(name)?.kind()?;
        age_in_units_at(kind.definition(), &self.last(name)?, &self.now)
    }

    pub fn is_stale(&self, name: &str) -> Result<bool> {
        Ok(self.age_in_units(name)? > 0)
    }

    pub fn never_executed(&self, name: &str) -> Result<bool> {
        Ok(is_sentinel(&self.last(name)?))
    }

    /// Stale interval names, coarsest interval first. Intervals that failed
    /// to resolve are left out; see `failures`.
    pub fn stale_intervals(&self) -> Result<Vec<String>> {
        let mut stale = Vec::new();
        for target in self.resolved_targets() {
            if self.is_stale(&target.name)? {
                stale.push(target.name.clone());
            }
        }
        log::debug!("Stale intervals: {:?}", stale);
        Ok(stale)
    }

    /// Intervals whose timestamp could not be resolved, with the reason.
    pub fn failures(&self) -> Vec<(String, LastBackupError)> {
        self.resolution
            .failures()
            .map(|(name, e)| (name.clone(), e.clone()))
            .collect()
    }

    fn resolved_targets(&self) -> Vec<&'a BackupTarget> {
        self.config
            .ordered_targets()
            .into_iter()
            .filter(|t| self.resolution.get(&t.name).is_ok())
            .collect()
    }

    pub fn report(&self, name: &str) -> Result<IntervalReport> {
        let target = self.config.target(name)?;
        let kind = target.kind()?;
        let definition = kind.definition();
        let resolved = self.resolution.get(name)?;
        let age = age_in_units_at(definition, &resolved.at, &self.now)?;

        Ok(IntervalReport {
            name: target.name.clone(),
            repo: target.repo.clone(),
            kind,
            last: resolved.at.format(CACHE_TIME_FORMAT).to_string(),
            label: resolved.at.format(definition.display_format).to_string(),
            age,
            unit: definition.unit_label(age).to_string(),
            stale: age > 0,
            never_executed: is_sentinel(&resolved.at),
            source: resolved.source,
        })
    }

    /// Reports of the intervals that resolved, coarsest first.
    pub fn reports(&self) -> Result<Vec<IntervalReport>> {
        self.resolved_targets()
            .into_iter()
            .map(|t| self.report(&t.name))
            .collect()
    }
}
