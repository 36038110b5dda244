use anyhow::{bail, Result};
use clap::Parser;
use env_logger::{Builder as LogBuilder, Env};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use lastbackup::core::config::{default_config_path, Config};
use lastbackup::core::{dispatch_stage, App, LastBackupError, Registry};
use lastbackup::handles;
use lastbackup::handles::automation::backup::SourceMode;

/// Tracks when each backup interval last ran and runs the stale ones through borg
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// List registered URL schemes and exit
    #[arg(long)]
    list_schemas: bool,

    /// Pretty-print JSON outputs when possible
    #[arg(long)]
    json_pretty: bool,

    /// Configuration file (default: $XDG_CONFIG_HOME/lastbackup/config.yml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where timestamps come from: live (repository when reachable) or cached
    #[arg(long, default_value = "live")]
    source: SourceMode,

    /// More log output; repeat for debug
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// A single command stage like: backup://daily.status or dest://offsite.probe(retries=3)
    #[arg(value_name = "STAGE")]
    stage: Option<String>,

    /// Additional arguments passed to the command as key=value pairs
    #[arg(value_name = "ARGS")]
    args: Vec<String>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    LogBuilder::from_env(Env::default().default_filter_or(level)).init();
}

fn write_output(buf: &[u8], pretty: bool) -> Result<()> {
    let mut stdout = std::io::stdout();
    if pretty {
        if let Ok(text) = std::str::from_utf8(buf) {
            if let Ok(val) = serde_json::from_str::<serde_json::Value>(text) {
                writeln!(stdout, "{}", serde_json::to_string_pretty(&val)?)?;
                return Ok(());
            }
        }
    }
    stdout.write_all(buf)?;
    Ok(())
}

fn run(cli: Cli) -> Result<i32> {
    if cli.list_schemas {
        let mut reg = Registry::default();
        handles::register_all(&mut reg, Arc::new(App::new(Config::default())));
        for s in reg.list_schemes() {
            println!("{}", s);
        }
        return Ok(0);
    }

    let Some(stage) = cli.stage else {
        bail!("No stage provided. Try --list-schemas");
    };

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = Config::load(&config_path)?;
    let app = Arc::new(App::new(config).with_mode(cli.source));
    let mut reg = Registry::default();
    handles::register_all(&mut reg, app);

    // Capture output so we can optionally pretty-print JSON
    let mut buf: Vec<u8> = Vec::new();
    let result = dispatch_stage(&reg, &stage, &cli.args, &mut buf, &mut std::io::stderr());
    write_output(&buf, cli.json_pretty)?;

    let status = result?;
    if let Some(reason) = &status.reason {
        eprintln!("{}", reason);
    }
    Ok(status.exit_code())
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            match e.downcast_ref::<LastBackupError>() {
                Some(LastBackupError::CommandExecutionFailed(failure)) => eprintln!("{}", failure),
                _ => eprintln!("lastbackup: {:#}", e),
            }
            std::process::exit(1);
        }
    }
}
