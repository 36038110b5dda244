use anyhow::{bail, Result};
use serde_json::json;
use std::sync::Arc;
use url::Url;

use super::backup::pipeline::{BackupPipeline, RunRecord, Stage};
use crate::core::context::App;
use crate::core::envelope::{BackendInfo, RunEnvelope, RunError, Timer};
use crate::core::error::LastBackupError;
use crate::core::{
    registry::{Args, Handle, IoStreams},
    status::Status,
};

/// Host name addressing every configured interval at once.
pub const ALL_TARGETS: &str = "all";

pub fn register(reg: &mut crate::core::Registry, app: Arc<App>) {
    reg.register_scheme("backup", move |u| Ok(Box::new(BackupHandle::from_url(u, app.clone())?)));
}

/// `backup://<name>.<verb>`; `backup://all.<verb>` for the summary verbs.
pub struct BackupHandle {
    name: String,
    target: String,
    app: Arc<App>,
}

impl BackupHandle {
    pub fn from_url(u: &Url, app: Arc<App>) -> Result<Self> {
        let name = match u.host_str() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => bail!("backup:// URL missing interval name"),
        };
        if name != ALL_TARGETS {
            app.config.target(&name)?;
        }
        Ok(Self {
            name,
            target: u.to_string(),
            app,
        })
    }

    fn is_all(&self) -> bool {
        self.name == ALL_TARGETS
    }

    /// Names and reasons of the intervals that could not be resolved.
    fn failed_json(failures: &[(String, LastBackupError)]) -> serde_json::Value {
        failures
            .iter()
            .map(|(name, e)| json!({ "name": name, "error": e.to_string() }))
            .collect()
    }

    /// Non-zero when any interval in a summary could not be resolved.
    fn summary_status(failures: &[(String, LastBackupError)]) -> Status {
        if failures.is_empty() {
            Status::ok()
        } else {
            Status::err(1, format!("{} interval(s) could not be resolved", failures.len()))
        }
    }

    fn verb_status(&self, io: &mut IoStreams) -> Result<Status> {
        let engine = self.app.staleness();
        if self.is_all() {
            let reports = engine.reports()?;
            let failures = engine.failures();
            for report in &reports {
                log::info!("{}", report);
            }
            let out = json!({ "intervals": reports, "failed": Self::failed_json(&failures) });
            writeln!(io.stdout, "{}", out)?;
            return Ok(Self::summary_status(&failures));
        }
        let report = engine.report(&self.name)?;
        log::info!("{}", report);
        writeln!(io.stdout, "{}", serde_json::to_string(&report)?)?;
        Ok(Status::ok())
    }

    fn verb_age(&self, io: &mut IoStreams) -> Result<Status> {
        let report = self.app.staleness().report(&self.name)?;
        let out = json!({
            "name": report.name,
            "age": report.age,
            "unit": report.unit,
        });
        writeln!(io.stdout, "{}", out)?;
        Ok(Status::ok())
    }

    fn verb_stale(&self, io: &mut IoStreams) -> Result<Status> {
        let engine = self.app.staleness();
        if self.is_all() {
            let failures = engine.failures();
            let out = json!({
                "stale": engine.stale_intervals()?,
                "failed": Self::failed_json(&failures),
            });
            writeln!(io.stdout, "{}", out)?;
            return Ok(Self::summary_status(&failures));
        }
        let out = json!({ "name": self.name, "stale": engine.is_stale(&self.name)? });
        writeln!(io.stdout, "{}", out)?;
        Ok(Status::ok())
    }

    fn verb_last(&self, io: &mut IoStreams) -> Result<Status> {
        let report = self.app.staleness().report(&self.name)?;
        let out = json!({
            "name": report.name,
            "last": report.last,
            "source": report.source,
            "never_executed": report.never_executed,
        });
        writeln!(io.stdout, "{}", out)?;
        Ok(Status::ok())
    }

    fn fail(
        &self,
        io: &mut IoStreams,
        backend: BackendInfo,
        err: LastBackupError,
        timer: &Timer,
    ) -> Result<Status> {
        let envelope = RunEnvelope::error("run", &self.target, backend, RunError::from_error(&err), timer.elapsed_ms());
        writeln!(io.stdout, "{}", envelope.to_json(false)?)?;
        Err(err.into())
    }

    /// Sends the completion message to the destination host, if it listens.
    fn notify(&self, record: &RunRecord, envelope: &mut RunEnvelope) -> Result<()> {
        let target = self.app.config.target(&self.name)?;
        let dest = self.app.config.destination_for(target)?;
        let Some(port) = dest.notification_port else {
            return Ok(());
        };
        let host = if dest.is_remote() || dest.host.is_some() {
            match self.app.hosts().resolve(dest) {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("No notification host for '{}': {}", target.destination, e);
                    return Ok(());
                }
            }
        } else {
            log::debug!("Destination '{}' has no host to notify", target.destination);
            return Ok(());
        };

        let message = format!("{} backup finished: {}", record.target, record.archive);
        if self.app.notifier().send(Some(&host), Some(port), &message) {
            envelope.add_event("info", "notification sent", "notify");
        } else {
            envelope.add_warning(format!("notification to {}:{} not delivered", host, port));
        }
        Ok(())
    }

    fn verb_run(&self, io: &mut IoStreams) -> Result<Status> {
        let timer = Timer::new();
        let target = self.app.config.target(&self.name)?;
        let repository = self.app.config.repository_for(target)?;
        let mut backend = BackendInfo::new("borg").with_repository(&repository);

        let runner = match self.app.runner_for(target) {
            Ok(r) => r,
            Err(e) => return self.fail(io, backend, e, &timer),
        };
        let hooks = self.app.hook_runner(target);
        let pipeline = BackupPipeline::new(target, repository.clone(), self.app.borg(), &runner, &hooks);

        let record = match pipeline.run(&self.app.now()) {
            Ok(record) => record,
            Err(e) => {
                if let LastBackupError::CommandExecutionFailed(f) = &e {
                    backend.set_command(f.argv.clone());
                    backend.set_env(&f.env);
                }
                return self.fail(io, backend, e, &timer);
            }
        };

        if let Some(create) = record.stages.iter().find(|s| s.stage == Stage::Create) {
            backend.set_command(create.argv.clone());
        }
        let result = serde_json::to_value(&record)?;
        let mut envelope = RunEnvelope::success("run", &self.target, backend.clone(), result, 0);
        for stage in &record.stages {
            envelope.add_event(
                "info",
                &format!("{} finished in {} ms", stage.argv.join(" "), stage.duration_ms),
                stage.stage.as_str(),
            );
        }

        match self.app.refresh_cache() {
            Ok(refresh) => {
                envelope.add_event("info", "cache refreshed", "cache");
                for (name, e) in refresh.resolution.failures() {
                    envelope.add_warning(format!("last backup of '{}' not refreshed: {}", name, e));
                }
            }
            Err(e) => return self.fail(io, backend, e, &timer),
        }
        self.notify(&record, &mut envelope)?;

        envelope.duration_ms = timer.elapsed_ms();
        writeln!(io.stdout, "{}", envelope.to_json(false)?)?;
        Ok(Status::ok())
    }
}

impl Handle for BackupHandle {
    fn verbs(&self) -> &'static [&'static str] {
        &["status", "age", "stale", "last", "run"]
    }

    fn call(&self, verb: &str, _args: &Args, io: &mut IoStreams) -> Result<Status> {
        match (verb, self.is_all()) {
            ("status", _) => self.verb_status(io),
            ("stale", _) => self.verb_stale(io),
            ("age", false) => self.verb_age(io),
            ("last", false) => self.verb_last(io),
            ("run", false) => self.verb_run(io),
            (_, true) => Ok(Status::err(2, format!("verb '{}' needs a single interval, not backup://all", verb))),
            _ => bail!("unknown verb for backup://: {}", verb),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::backup::testing::RecordingSpawner;
    use crate::core::context::testing::app_in;
    use serde_json::Value;
    use tempfile::TempDir;

    const LISTING: &str = "daily-2024-03-14T02:00:00 Thu, 2024-03-14 02:00:03 [ab]\n";

    fn call(app: Arc<App>, url: &str, verb: &str) -> (Result<Status>, String) {
        let handle = BackupHandle::from_url(&Url::parse(url).unwrap(), app).unwrap();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut io = IoStreams {
            stdout: &mut stdout,
            stderr: &mut stderr,
        };
        let status = handle.call(verb, &Args::new(), &mut io);
        (status, String::from_utf8(stdout).unwrap())
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let app = Arc::new(app_in(&dir, Arc::new(RecordingSpawner::default())));
        assert!(BackupHandle::from_url(&Url::parse("backup://nightly").unwrap(), app).is_err());
    }

    #[test]
    fn test_status_single() {
        let dir = TempDir::new().unwrap();
        let app = Arc::new(app_in(&dir, Arc::new(RecordingSpawner::answering(LISTING))));
        let (status, out) = call(app, "backup://daily", "status");
        assert!(status.unwrap().ok);

        let v: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(v["name"], "daily");
        assert_eq!(v["kind"], "daily");
        assert_eq!(v["last"], "2024-03-14T02:00:00");
        assert_eq!(v["stale"], false);
        assert_eq!(v["source"], "live");
    }

    #[test]
    fn test_all_stale() {
        let dir = TempDir::new().unwrap();
        let app = Arc::new(app_in(&dir, Arc::new(RecordingSpawner::answering(LISTING))));
        let (status, out) = call(app, "backup://all", "stale");
        assert!(status.unwrap().ok);
        let v: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(v["stale"], serde_json::json!(["weekly"]));
    }

    /// `app_in` with an `offsite` alias that no ssh config defines.
    fn app_without_offsite_host(dir: &TempDir, spawner: Arc<RecordingSpawner>) -> App {
        let mut app = app_in(dir, spawner);
        let offsite = app.config.destinations.get_mut("offsite").unwrap();
        offsite.host = None;
        offsite.vpn = None;
        app
    }

    #[test]
    fn test_all_status_reports_failed_interval_separately() {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(RecordingSpawner::answering(LISTING));
        let app = Arc::new(app_without_offsite_host(&dir, spawner));
        let (status, out) = call(app, "backup://all", "status");

        let status = status.unwrap();
        assert!(!status.ok);
        assert_eq!(status.code, Some(1));
        let v: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(v["intervals"].as_array().unwrap().len(), 1);
        assert_eq!(v["intervals"][0]["name"], "daily");
        assert_eq!(v["failed"][0]["name"], "weekly");
    }

    #[test]
    fn test_single_interval_unaffected_by_other_failure() {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(RecordingSpawner::answering(LISTING));
        let app = Arc::new(app_without_offsite_host(&dir, spawner));
        let (status, out) = call(app.clone(), "backup://daily", "stale");
        assert!(status.unwrap().ok);
        let v: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(v["stale"], false);

        let (status, _) = call(app, "backup://weekly", "stale");
        let err = status.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LastBackupError>(),
            Some(LastBackupError::HostNotConfigured { .. })
        ));
    }

    #[test]
    fn test_run_succeeds_when_another_interval_fails() {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(RecordingSpawner::answering(LISTING));
        let app = Arc::new(app_without_offsite_host(&dir, spawner));
        let (status, out) = call(app, "backup://daily", "run");
        assert!(status.unwrap().ok);

        let v: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(v["ok"], true);
        let warnings = v["warnings"].as_array().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].as_str().unwrap().contains("'weekly'"));

        let cache = std::fs::read_to_string(dir.path().join(".lastbackups")).unwrap();
        assert!(cache.contains("daily;2024-03-14T02:00:00"));
    }

    #[test]
    fn test_local_destination_without_host_is_not_notified() {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(RecordingSpawner::answering(LISTING));
        let mut app = app_in(&dir, spawner);
        app.config.destinations.get_mut("nas").unwrap().notification_port = Some(4040);
        let (status, out) = call(Arc::new(app), "backup://daily", "run");
        assert!(status.unwrap().ok);

        let v: Value = serde_json::from_str(out.trim()).unwrap();
        assert!(v["warnings"].as_array().unwrap().is_empty());
        assert!(!v["events"].as_array().unwrap().iter().any(|e| e["phase"] == "notify"));
    }

    #[test]
    fn test_run_on_all_is_refused() {
        let dir = TempDir::new().unwrap();
        let app = Arc::new(app_in(&dir, Arc::new(RecordingSpawner::default())));
        let (status, _) = call(app, "backup://all", "run");
        assert_eq!(status.unwrap().code, Some(2));
    }

    #[test]
    fn test_run_success_refreshes_cache() {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(RecordingSpawner::answering(LISTING));
        let app = Arc::new(app_in(&dir, spawner.clone()));
        let (status, out) = call(app, "backup://daily", "run");
        assert!(status.unwrap().ok);

        let v: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(v["result"]["archive"], "daily-2024-03-14T12:00:00");
        assert_eq!(v["backend"]["command"][1], "create");

        let argvs = spawner.argvs();
        let words: Vec<&str> = argvs.iter().map(|a| a[1].as_str()).collect();
        assert_eq!(words, vec!["/mnt/nas", "create", "prune", "/mnt/nas", "list"]);

        let cache = std::fs::read_to_string(dir.path().join(".lastbackups")).unwrap();
        assert!(cache.contains("daily;2024-03-14T02:00:00"));
    }

    #[test]
    fn test_run_failure_writes_error_envelope() {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(RecordingSpawner::failing_on("create"));
        let app = Arc::new(app_in(&dir, spawner.clone()));
        let (status, out) = call(app, "backup://daily", "run");

        let err = status.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LastBackupError>(),
            Some(LastBackupError::CommandExecutionFailed(_))
        ));
        let v: Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["kind"], "command_failed");
        assert!(!dir.path().join(".lastbackups").exists());
    }
}
