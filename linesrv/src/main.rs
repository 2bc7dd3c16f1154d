use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

use mailbox::{line_source, LineSourceKind, MailboxConfig, MailboxError, SessionConfig, Supervisor};

mod logging;
mod report;

#[derive(clap::ValueEnum, Copy, Clone, Debug)]
enum LineSourceArg {
    Scan,
    Indexed,
}

impl From<LineSourceArg> for LineSourceKind {
    fn from(arg: LineSourceArg) -> Self {
        match arg {
            LineSourceArg::Scan => LineSourceKind::Scan,
            LineSourceArg::Indexed => LineSourceKind::Indexed,
        }
    }
}

#[derive(clap::Parser)]
#[clap(about = "Serves document lines to forked clients through a semaphore-guarded shared mailbox")]
struct Opts {
    /// Document whose lines are served.
    file_path: PathBuf,
    /// Number of client processes to fork.
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    client_count: u32,
    /// Requests issued by every client.
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    requests_per_client: u32,
    #[clap(short = 'c', long = "config")]
    config: Option<PathBuf>,
    /// Session seed for the request sampler.
    #[clap(long)]
    seed: Option<u64>,
    #[clap(long = "line-source", value_enum)]
    line_source: Option<LineSourceArg>,
    /// More output, repeatable.
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only errors and the final report.
    #[clap(short = 'q', long = "quiet", action = clap::ArgAction::SetTrue, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct LinesrvConfig {
    #[serde(default)]
    shmem: MailboxConfig,
    #[serde(default)]
    line_source: LineSourceKind,
    #[serde(default)]
    seed: Option<u64>,
    /// tracing filter directive, e.g. `info` or `mailbox=debug`.
    #[serde(default)]
    log: Option<String>,
}

fn main() -> ExitCode {
    let opts: Opts = Opts::parse();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(opts: &Opts) -> anyhow::Result<LinesrvConfig> {
    match &opts.config {
        Some(path) => confy::load_path(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(LinesrvConfig::default()),
    }
}

fn run(opts: &Opts) -> anyhow::Result<()> {
    let cfg = load_config(opts)?;
    logging::init(&logging::LogConfig::from_flags(opts.verbose, opts.quiet, cfg.log.as_deref()))?;
    debug!(?cfg, "configuration loaded");

    let kind = opts.line_source.map(LineSourceKind::from).unwrap_or(cfg.line_source);
    let source = line_source::open(kind, &opts.file_path)?;
    if source.line_count() == 0 {
        bail!(MailboxError::EmptyDocument(opts.file_path.clone()));
    }
    debug!(lines = source.line_count(), ?kind, "document opened");

    let session = SessionConfig {
        client_count: opts.client_count,
        requests_per_client: opts.requests_per_client,
        seed: opts.seed.or(cfg.seed),
        shmem: cfg.shmem,
    };
    let report = Supervisor::new(session).run(source.as_ref())?;
    report::print(&report, &mut std::io::stdout().lock())?;
    Ok(())
}
