use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::io;
use std::process::{Command, Stdio};
use std::time::Instant;

use crate::core::config::{BackupTarget, Config};
use crate::core::error::{CommandFailure, LastBackupError, Result};
use crate::handles::security::secreth::SecretSource;

pub mod borg;

pub use borg::BorgCommands;

/// Variable borg reads the repository passphrase from.
pub const PASSPHRASE_ENV: &str = "BORG_PASSPHRASE";

/// How the child's output streams are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Pipe stdout/stderr and hand them back to the caller.
    Captured,
    /// Child writes straight to our stdout/stderr (long-running create/prune).
    Continuous,
}

/// Fully prepared command: argument vector plus extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Result of running a child process to completion
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Process-spawn primitive; no shell is ever involved.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, invocation: &Invocation, mode: OutputMode) -> io::Result<ProcessOutput>;
}

/// Spawns real child processes through `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpawner;

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, invocation: &Invocation, mode: OutputMode) -> io::Result<ProcessOutput> {
        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"))?;

        let start = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args).envs(&invocation.env);

        let output = match mode {
            OutputMode::Captured => {
                let out = cmd
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .output()?;
                ProcessOutput {
                    exit_code: out.status.code(),
                    success: out.status.success(),
                    stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                    duration_ms: 0,
                }
            }
            OutputMode::Continuous => {
                let status = cmd
                    .stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit())
                    .status()?;
                ProcessOutput {
                    exit_code: status.code(),
                    success: status.success(),
                    ..ProcessOutput::default()
                }
            }
        };

        Ok(ProcessOutput {
            duration_ms: start.elapsed().as_millis() as u64,
            ..output
        })
    }
}

/// Passphrase lookup bound to one destination.
pub struct PassphraseLookup<'a> {
    pub source: &'a dyn SecretSource,
    pub entry: String,
}

/// Runs commands on behalf of one backup target.
///
/// Encrypted destinations get `BORG_PASSPHRASE` injected (fetched once, on first
/// use) and `sudo` targets get every argument vector prefixed with `sudo`.
/// A non-zero exit is always `LastBackupError::CommandExecutionFailed`.
pub struct CommandRunner<'a> {
    spawner: &'a dyn ProcessSpawner,
    sudo: bool,
    passphrase: Option<PassphraseLookup<'a>>,
    repository: Option<String>,
    secret: OnceCell<String>,
}

impl<'a> CommandRunner<'a> {
    pub fn new(spawner: &'a dyn ProcessSpawner) -> Self {
        Self {
            spawner,
            sudo: false,
            passphrase: None,
            repository: None,
            secret: OnceCell::new(),
        }
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn with_passphrase(mut self, lookup: PassphraseLookup<'a>) -> Self {
        self.passphrase = Some(lookup);
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn repository(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    fn passphrase(&self) -> Result<Option<&str>> {
        let Some(lookup) = &self.passphrase else {
            return Ok(None);
        };
        if self.secret.get().is_none() {
            log::debug!("Fetching passphrase entry='{}'", lookup.entry);
            let value = lookup.source.fetch(&lookup.entry)?;
            let _ = self.secret.set(value);
        }
        Ok(self.secret.get().map(String::as_str))
    }

    /// Merge environment, apply the sudo prefix and produce the final invocation.
    pub fn prepare(&self, env_overrides: &BTreeMap<String, String>, argv: &[String]) -> Result<Invocation> {
        let mut env = env_overrides.clone();
        if let Some(secret) = self.passphrase()? {
            env.insert(PASSPHRASE_ENV.to_string(), secret.to_string());
        }

        let mut full = Vec::with_capacity(argv.len() + 2);
        if self.sudo {
            full.push("sudo".to_string());
            if !env.is_empty() {
                let keys: Vec<&str> = env.keys().map(String::as_str).collect();
                full.push(format!("--preserve-env={}", keys.join(",")));
            }
        }
        full.extend(argv.iter().cloned());

        Ok(Invocation { argv: full, env })
    }

    /// Run `argv`; returns captured stdout (empty in continuous mode).
    pub fn run(
        &self,
        env_overrides: &BTreeMap<String, String>,
        argv: &[String],
        mode: OutputMode,
    ) -> Result<String> {
        let invocation = self.prepare(env_overrides, argv)?;
        let failure = |exit_code: Option<i32>, stdout: String, stderr: String| {
            CommandFailure {
                argv: invocation.argv.clone(),
                env: invocation.env.clone(),
                repository: self.repository.clone(),
                exit_code,
                stdout,
                stderr,
            }
        };

        log::debug!("Running command mode={:?} argv={:?}", mode, invocation.argv);
        let output = match self.spawner.spawn(&invocation, mode) {
            Ok(output) => output,
            Err(e) => {
                let f = failure(None, String::new(), format!("failed to start command: {}", e));
                log::error!("Command could not be started: {}", e);
                return Err(LastBackupError::CommandExecutionFailed(Box::new(f)));
            }
        };

        if !output.success {
            log::error!(
                "Command failed exit_code={:?} duration_ms={} argv={:?}",
                output.exit_code, output.duration_ms, invocation.argv
            );
            let f = failure(output.exit_code, output.stdout, output.stderr);
            return Err(LastBackupError::CommandExecutionFailed(Box::new(f)));
        }

        log::debug!("Command succeeded duration_ms={}", output.duration_ms);
        Ok(output.stdout)
    }

    /// Captured-mode shorthand without extra environment.
    pub fn capture(&self, argv: &[String]) -> Result<String> {
        self.run(&BTreeMap::new(), argv, OutputMode::Captured)
    }

    /// Continuous-mode shorthand without extra environment.
    pub fn stream(&self, argv: &[String]) -> Result<()> {
        self.run(&BTreeMap::new(), argv, OutputMode::Continuous).map(|_| ())
    }
}

/// Runner for borg commands against `target`'s repository.
pub fn runner_for<'a>(
    config: &Config,
    target: &BackupTarget,
    spawner: &'a dyn ProcessSpawner,
    secrets: &'a dyn SecretSource,
) -> Result<CommandRunner<'a>> {
    let dest = config.destination_for(target)?;
    let mut runner = CommandRunner::new(spawner)
        .with_sudo(target.sudo)
        .with_repository(config.repository_for(target)?);
    if dest.encrypted {
        runner = runner.with_passphrase(PassphraseLookup {
            source: secrets,
            entry: dest.passphrase_entry(&target.destination),
        });
    }
    Ok(runner)
}

/// Splits a hook command line into words without invoking a shell.
///
/// Single and double quotes group words; a backslash escapes the next character
/// outside single quotes. A quote left open is an `InvalidConfiguration`.
pub fn split_command_words(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some('\''), c) => current.push(c),
            (_, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(ch);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if let Some(q) = quote {
        return Err(LastBackupError::InvalidConfiguration(format!(
            "unterminated {} quote in command '{}'",
            q, input
        )));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation and fails those whose argv contains `fail_on`.
    #[derive(Default)]
    pub struct RecordingSpawner {
        pub calls: Mutex<Vec<(Invocation, OutputMode)>>,
        pub fail_on: Option<String>,
        pub stdout: String,
    }

    impl RecordingSpawner {
        pub fn failing_on(word: &str) -> Self {
            Self {
                fail_on: Some(word.to_string()),
                ..Self::default()
            }
        }

        pub fn answering(stdout: &str) -> Self {
            Self {
                stdout: stdout.to_string(),
                ..Self::default()
            }
        }

        pub fn argvs(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().iter().map(|(i, _)| i.argv.clone()).collect()
        }
    }

    impl ProcessSpawner for RecordingSpawner {
        fn spawn(&self, invocation: &Invocation, mode: OutputMode) -> io::Result<ProcessOutput> {
            self.calls.lock().unwrap().push((invocation.clone(), mode));
            let failed = self
                .fail_on
                .as_ref()
                .map(|w| invocation.argv.iter().any(|a| a == w))
                .unwrap_or(false);
            Ok(ProcessOutput {
                exit_code: Some(if failed { 2 } else { 0 }),
                success: !failed,
                stdout: if failed { String::new() } else { self.stdout.clone() },
                stderr: if failed { "boom".to_string() } else { String::new() },
                duration_ms: 1,
            })
        }
    }

    pub struct FixedSecret(pub &'static str);

    impl SecretSource for FixedSecret {
        fn fetch(&self, _entry: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_run_returns_captured_stdout() {
        let spawner = SystemSpawner;
        let runner = CommandRunner::new(&spawner);
        let out = runner.capture(&argv(&["echo", "hello"])).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_run_failing_command_is_fatal() {
        let spawner = SystemSpawner;
        let runner = CommandRunner::new(&spawner).with_repository("/srv/repo");
        let err = runner
            .capture(&argv(&["sh", "-c", "echo oops >&2; exit 3"]))
            .unwrap_err();
        match err {
            LastBackupError::CommandExecutionFailed(f) => {
                assert_eq!(f.exit_code, Some(3));
                assert_eq!(f.stderr, "oops\n");
                assert_eq!(f.repository.as_deref(), Some("/srv/repo"));
                assert_eq!(f.argv[0], "sh");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_continuous_failure_is_fatal() {
        let spawner = SystemSpawner;
        let runner = CommandRunner::new(&spawner);
        let err = runner.stream(&argv(&["false"])).unwrap_err();
        assert!(matches!(err, LastBackupError::CommandExecutionFailed(_)));
    }

    #[test]
    fn test_missing_binary_is_fatal() {
        let spawner = SystemSpawner;
        let runner = CommandRunner::new(&spawner);
        let err = runner
            .capture(&argv(&["definitely-not-a-real-binary-4711"]))
            .unwrap_err();
        match err {
            LastBackupError::CommandExecutionFailed(f) => {
                assert_eq!(f.exit_code, None);
                assert!(f.stderr.contains("failed to start"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_env_overrides_reach_child() {
        let spawner = SystemSpawner;
        let runner = CommandRunner::new(&spawner);
        let mut env = BTreeMap::new();
        env.insert("LASTBACKUP_PROBE".to_string(), "42".to_string());
        let out = runner
            .run(&env, &argv(&["sh", "-c", "printf %s \"$LASTBACKUP_PROBE\""]), OutputMode::Captured)
            .unwrap();
        assert_eq!(out, "42");
    }

    #[test]
    fn test_passphrase_and_sudo_prefix() {
        let spawner = RecordingSpawner::default();
        let secret = FixedSecret("s3cret");
        let runner = CommandRunner::new(&spawner)
            .with_sudo(true)
            .with_passphrase(PassphraseLookup { source: &secret, entry: "borg/nas".into() });

        runner.capture(&argv(&["borg", "list", "/repo"])).unwrap();

        let calls = spawner.calls.lock().unwrap();
        let (invocation, mode) = &calls[0];
        assert_eq!(*mode, OutputMode::Captured);
        assert_eq!(
            invocation.argv,
            argv(&["sudo", "--preserve-env=BORG_PASSPHRASE", "borg", "list", "/repo"])
        );
        assert_eq!(invocation.env.get(PASSPHRASE_ENV).map(String::as_str), Some("s3cret"));
    }

    #[test]
    fn test_plain_sudo_without_env() {
        let spawner = RecordingSpawner::default();
        let runner = CommandRunner::new(&spawner).with_sudo(true);
        let invocation = runner.prepare(&BTreeMap::new(), &argv(&["borg", "info"])).unwrap();
        assert_eq!(invocation.argv, argv(&["sudo", "borg", "info"]));
        assert!(invocation.env.is_empty());
    }

    #[test]
    fn test_failure_carries_injected_env() {
        let spawner = RecordingSpawner::failing_on("create");
        let secret = FixedSecret("s3cret");
        let runner = CommandRunner::new(&spawner)
            .with_passphrase(PassphraseLookup { source: &secret, entry: "e".into() });
        let err = runner.stream(&argv(&["borg", "create", "/r::a", "/home"])).unwrap_err();
        match err {
            LastBackupError::CommandExecutionFailed(f) => {
                assert!(f.env.contains_key(PASSPHRASE_ENV));
                assert!(!f.to_string().contains("s3cret"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_runner_for_encrypted_sudo_target() {
        use crate::core::config::SAMPLE_CONFIG;
        use std::path::Path;

        let config = Config::from_yaml(SAMPLE_CONFIG, Path::new("test.yml")).unwrap();
        let spawner = RecordingSpawner::default();
        let secret = FixedSecret("pw");

        let weekly = runner_for(&config, config.target("weekly").unwrap(), &spawner, &secret).unwrap();
        assert_eq!(weekly.repository(), Some("vault:/srv/borg/weekly"));
        let inv = weekly.prepare(&BTreeMap::new(), &argv(&["borg", "list"])).unwrap();
        assert_eq!(inv.argv[0], "sudo");
        assert_eq!(inv.env.get(PASSPHRASE_ENV).map(String::as_str), Some("pw"));

        let daily = runner_for(&config, config.target("daily").unwrap(), &spawner, &secret).unwrap();
        let inv = daily.prepare(&BTreeMap::new(), &argv(&["borg", "list"])).unwrap();
        assert_eq!(inv.argv, argv(&["borg", "list"]));
        assert!(inv.env.is_empty());
    }

    #[test]
    fn test_split_command_words() {
        assert_eq!(split_command_words("mount /mnt/nas").unwrap(), vec!["mount", "/mnt/nas"]);
        assert_eq!(
            split_command_words(r#"notify-send "backup done" 'it''s' a\ b"#).unwrap(),
            vec!["notify-send", "backup done", "its", "a b"]
        );
        assert_eq!(split_command_words("  echo   \"\"  ").unwrap(), vec!["echo", ""]);
        assert!(split_command_words("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_rejects_open_quote() {
        assert!(matches!(
            split_command_words("echo 'abc"),
            Err(LastBackupError::InvalidConfiguration(_))
        ));
        assert!(split_command_words(r#"echo "a b"#).is_err());
    }
}
