pub mod backends;
pub mod core;
pub mod handles;

pub use crate::core::{App, Handle, LastBackupError, Registry, Status};
