//! Logging setup shared by all medkgctl subcommands. Libraries only emit
//! tracing events; the subscriber is installed exactly once, here.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// Log verbosity.
    #[arg(long = "log-level", value_enum, ignore_case = true, global = true)]
    pub log_level: Option<LogLevel>,

    /// Write logs to this file instead of stderr (plain text, no colors).
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, clap::ValueEnum, Clone, Copy, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// File target for tracing's writer: cheap clones over one shared handle.
#[derive(Clone)]
struct FileWriter(Arc<File>);

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self.0).flush()
    }
}

/// Initialize logging once. `--quiet` drops to errors only and `--verbose`
/// raises to debug, unless an explicit level is given.
pub fn init(args: &LogArgs, quiet: bool, verbose: bool) -> anyhow::Result<()> {
    let level = match (args.log_level, quiet, verbose) {
        (Some(level), _, _) => level,
        (None, true, _) => LogLevel::Error,
        (None, _, true) => LogLevel::Debug,
        (None, false, false) => LogLevel::Warning,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(level.filter())
        .with_target(false);

    match &args.log_file {
        Some(path) => {
            let file = File::create(path)
                .map_err(|err| anyhow::anyhow!("cannot open log file {}: {err}", path.display()))?;
            let writer = FileWriter(Arc::new(file));
            builder
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .init();
        }
        None => {
            let color = atty::is(atty::Stream::Stderr);
            builder
                .with_writer(std::io::stderr)
                .with_ansi(color)
                .init();
        }
    }
    Ok(())
}
