use std::sync::Arc;

use crate::backends::backup::{CommandRunner, ProcessSpawner};
use crate::core::error::{LastBackupError, Result};

/// Source of repository passphrases.
pub trait SecretSource: Send + Sync {
    /// Returns the secret stored under `entry`, a single line without newline.
    fn fetch(&self, entry: &str) -> Result<String>;
}

/// Asks an external password store, `pass show <entry>` by default.
///
/// Only the first line of the command's output is used; password stores keep
/// metadata on the following lines.
pub struct CommandSecretSource {
    command: Vec<String>,
    spawner: Arc<dyn ProcessSpawner>,
}

impl CommandSecretSource {
    pub fn new(command: Vec<String>, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { command, spawner }
    }
}

impl SecretSource for CommandSecretSource {
    fn fetch(&self, entry: &str) -> Result<String> {
        if self.command.is_empty() {
            return Err(LastBackupError::MissingConfiguration("secret_command".to_string()));
        }
        let mut argv = self.command.clone();
        argv.push(entry.to_string());

        let output = CommandRunner::new(self.spawner.as_ref()).capture(&argv)?;
        first_line(&output).ok_or_else(|| {
            LastBackupError::InvalidConfiguration(format!("secret entry '{}' is empty", entry))
        })
    }
}

fn first_line(output: &str) -> Option<String> {
    output
        .lines()
        .next()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty())
}
