pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod parse;
pub mod registry;
pub mod status;

pub use context::App;
pub use error::LastBackupError;
pub use registry::{Args, Handle, IoStreams, Registry};
pub use status::Status;

use anyhow::Result;
use std::io::Write;

pub fn dispatch_stage(
    reg: &Registry,
    stage_str: &str,
    cli_args: &[String],
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
) -> Result<Status> {
    let mut parsed = parse::parse_stage(stage_str)?;

    // key=value arguments after the stage override those inside the parentheses
    for arg in cli_args {
        if let Some((key, value)) = arg.split_once('=') {
            parsed.args.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    let h = reg.resolve(&parsed.target)?;
    if !h.verbs().contains(&parsed.verb.as_str()) {
        return Ok(Status::err(
            2,
            format!("unknown verb '{}', expected one of: {}", parsed.verb, h.verbs().join(", ")),
        ));
    }
    log::debug!("Dispatching target='{}' verb='{}' args={:?}", parsed.target, parsed.verb, parsed.args);

    let mut io = IoStreams { stdout, stderr };
    h.call(&parsed.verb, &parsed.args, &mut io)
}
