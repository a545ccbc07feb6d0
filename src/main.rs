use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tsumugi::{CacheStore, Environment, Executor, Mode, Paths, Pipeline};

/// Builds the front-end assets of a project.
#[derive(Parser, Debug)]
#[command(name = "tsumugi", version, about)]
struct Cli {
    /// Project root, every path is relative to it.
    #[arg(long, default_value = ".")]
    root: Utf8PathBuf,

    /// Maximum number of tasks running at once.
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Don't read or write the transform cache.
    #[arg(long)]
    no_cache: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Build everything once.
    Build,
    /// Build, then rebuild on changes and live-reload the browser.
    Serve,
    /// Empty the output directory.
    Clean,
}

fn main() -> ExitCode {
    tsumugi::init_logging();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let command = cli.command.unwrap_or(Command::Serve);
    let mode = match command {
        Command::Serve => Mode::Serve,
        Command::Build | Command::Clean => Mode::Build,
    };

    let root = cli.root.canonicalize_utf8()?;
    let mut pipeline = Pipeline::frontend(Environment::new(mode, root), &Paths::default())?;

    if let Some(limit) = cli.concurrency {
        pipeline = pipeline.with_executor(Executor::new().with_concurrency(limit));
    }
    if cli.no_cache {
        pipeline = pipeline.with_cache(None::<CacheStore>);
    }

    let report = match command {
        Command::Build => pipeline.build(),
        Command::Clean => pipeline.clean()?,
        Command::Serve => {
            pipeline.serve()?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    match report.check() {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("{report}");
            tracing::error!("{e}");
            Ok(ExitCode::FAILURE)
        }
    }
}
