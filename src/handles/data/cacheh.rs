use anyhow::Result as AnyResult;
use chrono::NaiveDateTime;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

use crate::core::context::App;
use crate::core::error::{LastBackupError, Result};
use crate::core::{
    registry::{Args, Handle, IoStreams},
    status::Status,
};
use crate::handles::automation::backup::intervals::{never_executed_sentinel, IntervalKind};
use crate::handles::filesystem::fs_atomic::{atomic_write, AtomicWriteOptions};

/// Timestamp layout of cache lines.
pub const CACHE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub type TimestampMap = BTreeMap<String, NaiveDateTime>;

pub fn register(reg: &mut crate::core::Registry, app: Arc<App>) {
    reg.register_scheme("cache", move |u| Ok(Box::new(CacheHandle::from_url(u, app.clone())?)));
}

/// Flat `name;timestamp` file with the last known good backup per interval.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    known: Vec<String>,
}

impl CacheStore {
    /// `known` lists the interval names in output order; each reads as the
    /// sentinel until the file says otherwise.
    pub fn new(path: impl Into<PathBuf>, known: Vec<String>) -> Self {
        Self {
            path: path.into(),
            known,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn baseline(&self) -> TimestampMap {
        let sentinel = never_executed_sentinel();
        IntervalKind::ALL
            .iter()
            .map(|k| k.as_str().to_string())
            .chain(self.known.iter().cloned())
            .map(|name| (name, sentinel))
            .collect()
    }

    fn read_error(&self, detail: impl Into<String>) -> LastBackupError {
        LastBackupError::CacheRead {
            path: self.path.clone(),
            detail: detail.into(),
        }
    }

    pub fn read(&self) -> Result<TimestampMap> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| self.read_error(e.to_string()))?;
        let mut entries = self.baseline();

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (name, raw) = line
                .split_once(';')
                .ok_or_else(|| self.read_error(format!("line {}: expected 'name;timestamp'", idx + 1)))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(self.read_error(format!("line {}: empty interval name", idx + 1)));
            }
            let at = NaiveDateTime::parse_from_str(raw.trim(), CACHE_TIME_FORMAT).map_err(|e| {
                self.read_error(format!("line {}: bad timestamp '{}': {}", idx + 1, raw.trim(), e))
            })?;
            entries.insert(name.to_string(), at);
        }

        log::debug!("Read {} cache entries from {}", entries.len(), self.path.display());
        Ok(entries)
    }

    /// Like `read`, but a missing file means nothing was ever cached.
    pub fn read_tolerant(&self) -> Result<TimestampMap> {
        if !self.path.exists() {
            log::warn!(
                "Cache file {} does not exist, every interval counts as never executed",
                self.path.display()
            );
            return Ok(self.baseline());
        }
        self.read()
    }

    /// Orders names as configured, then anything else alphabetically.
    fn ordered<'a>(&self, entries: &'a TimestampMap) -> Vec<(&'a str, &'a NaiveDateTime)> {
        let mut out: Vec<(&str, &NaiveDateTime)> = self
            .known
            .iter()
            .filter_map(|name| entries.get_key_value(name.as_str()))
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        out.extend(
            entries
                .iter()
                .filter(|(name, _)| !self.known.iter().any(|k| k == *name))
                .map(|(k, v)| (k.as_str(), v)),
        );
        out
    }

    pub fn render(&self, entries: &TimestampMap) -> String {
        self.ordered(entries)
            .into_iter()
            .map(|(name, at)| format!("{};{}\n", name, at.format(CACHE_TIME_FORMAT)))
            .collect()
    }

    /// Rewrites the whole file.
    pub fn write(&self, entries: &TimestampMap) -> Result<()> {
        let body = self.render(entries);
        let written = atomic_write(&self.path, body.as_bytes(), AtomicWriteOptions::default())?;
        log::info!("Wrote {} cache entries to {} ({} bytes)", entries.len(), written.path, written.bytes);
        Ok(())
    }
}

/// `cache://lastbackups.read` and `cache://lastbackups.refresh`
pub struct CacheHandle {
    app: Arc<App>,
}

impl CacheHandle {
    pub fn from_url(u: &Url, app: Arc<App>) -> AnyResult<Self> {
        match u.host_str() {
            Some("lastbackups") => Ok(Self { app }),
            other => anyhow::bail!("unknown cache '{}', expected cache://lastbackups", other.unwrap_or("")),
        }
    }

    fn entries_json(&self, entries: &TimestampMap) -> Value {
        let map: serde_json::Map<String, Value> = entries
            .iter()
            .map(|(k, v)| (k.clone(), json!(v.format(CACHE_TIME_FORMAT).to_string())))
            .collect();
        Value::Object(map)
    }

    fn verb_read(&self, io: &mut IoStreams) -> AnyResult<Status> {
        let store = self.app.cache();
        let entries = store.read()?;
        let out = json!({
            "path": store.path().to_string_lossy(),
            "entries": self.entries_json(&entries),
        });
        writeln!(io.stdout, "{}", out)?;
        Ok(Status::ok())
    }

    fn verb_refresh(&self, io: &mut IoStreams) -> AnyResult<Status> {
        let refresh = self.app.refresh_cache()?;
        let failed: Vec<Value> = refresh
            .resolution
            .failures()
            .map(|(name, e)| json!({ "name": name, "error": e.to_string() }))
            .collect();
        let out = json!({
            "path": self.app.cache().path().to_string_lossy(),
            "written": true,
            "entries": self.entries_json(&refresh.written),
            "failed": failed,
        });
        writeln!(io.stdout, "{}", out)?;
        if failed.is_empty() {
            Ok(Status::ok())
        } else {
            Ok(Status::err(1, format!("{} interval(s) kept their previous entry", failed.len())))
        }
    }
}

impl Handle for CacheHandle {
    fn verbs(&self) -> &'static [&'static str] {
        &["read", "refresh"]
    }

    fn call(&self, verb: &str, _args: &Args, io: &mut IoStreams) -> AnyResult<Status> {
        match verb {
            "read" => self.verb_read(io),
            "refresh" => self.verb_refresh(io),
            _ => Ok(Status::err(2, format!("unknown verb '{}' for cache://", verb))),
        }
    }
}
