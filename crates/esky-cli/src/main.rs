use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod render;

use dispatch::run_cli;

const LOG_ENV: &str = "ESKY_LOG";

#[derive(Parser, Debug)]
#[command(name = "esky")]
#[command(about = "Keep self-updating applications current", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Settings that override `esky.toml`.
#[derive(Args, Debug, Clone, Default)]
struct GlobalArgs {
    /// Config file; defaults to $ESKY_CONFIG, then ./esky.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    app_root: Option<PathBuf>,
    #[arg(long, global = true)]
    app_name: Option<String>,
    #[arg(long, global = true)]
    platform: Option<String>,
    #[arg(long, global = true)]
    summary_url: Option<String>,
    #[arg(long, value_enum, global = true)]
    strategy: Option<CliStrategy>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliStrategy {
    Auto,
    Direct,
    Staged,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Installed versions and their state.
    List,
    /// Versions the update source offers from the active one.
    FindUpdates,
    /// Download and prepare a version without installing it.
    Fetch { version: String },
    /// Install a fetched version.
    Install { version: String },
    Uninstall { version: String },
    /// Remove unused versions and update leftovers.
    Cleanup,
    /// Find, fetch and install the newest version, then clean up.
    AutoUpdate,
    /// Write a patch turning SOURCE into TARGET.
    Diff {
        source: PathBuf,
        target: PathBuf,
        output: PathBuf,
    },
    /// Apply a patch file to DIR in place.
    Patch { patch: PathBuf, dir: PathBuf },
    /// Launch the active version, forwarding ARGS.
    Bootstrap {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
    #[command(hide = true)]
    Helper {
        #[arg(long)]
        token: String,
        /// Pid of the app that asked for the helper.
        #[arg(long)]
        parent: Option<u32>,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let code = run_cli(cli)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests;
