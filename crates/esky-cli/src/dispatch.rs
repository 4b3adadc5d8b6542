use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use esky_app::{Esky, EskyConfig};
use esky_core::{AppLayout, EskyError};
use esky_fstxn::TxnStrategy;
use esky_installer::bootstrap::run_bootstrap;
use esky_patch::{apply_patch_in_place, diff_trees, read_patch_file, write_patch_file};
use esky_sudo::helper_main;

use crate::completion::write_completions_script;
use crate::render::{
    current_output_style, format_cleanup_lines, format_version_lines, render_status_line,
    FetchProgress, OutputStyle,
};
use crate::{CliStrategy, Commands, GlobalArgs};

impl From<CliStrategy> for TxnStrategy {
    fn from(strategy: CliStrategy) -> Self {
        match strategy {
            CliStrategy::Auto => TxnStrategy::Auto,
            CliStrategy::Direct => TxnStrategy::Direct,
            CliStrategy::Staged => TxnStrategy::Staged,
        }
    }
}

/// Runs one command and returns the process exit code.
pub(crate) fn run_cli(cli: crate::Cli) -> Result<i32> {
    let style = current_output_style();
    let global = cli.global;

    match cli.command {
        Commands::Diff {
            source,
            target,
            output,
        } => {
            let patch = diff_trees(&source, &target)?;
            write_patch_file(&patch, &output)?;
            println!(
                "{}",
                render_status_line(
                    style,
                    "ok",
                    &format!("wrote {} operations to {}", patch.len(), output.display())
                )
            );
        }
        Commands::Patch { patch, dir } => {
            let patch_set = read_patch_file(&patch)?;
            apply_patch_in_place(&patch_set, &dir)?;
            println!(
                "{}",
                render_status_line(
                    style,
                    "ok",
                    &format!("patched {} with {}", dir.display(), patch.display())
                )
            );
        }
        Commands::Completions { shell } => {
            let mut stdout = std::io::stdout();
            write_completions_script(shell, &mut stdout)?;
        }
        Commands::Bootstrap { args } => {
            let config = resolve_config(&global)?;
            let stub = std::env::current_exe().context("failed to locate the running stub")?;
            return run_bootstrap(
                &AppLayout::new(&config.app_root),
                &config.app_name,
                &stub,
                args,
            );
        }
        Commands::Helper { token, parent } => {
            let mut esky = open_esky(&global)?;
            helper_main(&mut esky, &token, parent)?;
        }
        Commands::List => {
            let esky = open_esky(&global)?;
            let versions = esky.list_versions()?;
            if versions.is_empty() {
                println!("No versions of {} installed", esky.app_name());
            }
            print_lines(&format_version_lines(style, &versions));
        }
        Commands::FindUpdates => {
            let mut esky = open_esky(&global)?;
            let versions = esky.find_versions()?;
            if versions.is_empty() {
                println!("{} is up to date", esky.app_name());
            }
            for version in versions {
                println!("{}", render_status_line(style, "update", &version.to_string()));
            }
        }
        Commands::Fetch { version } => {
            let mut esky = open_esky(&global)?;
            let name = esky.version_name(&version)?;
            let mut progress = FetchProgress::new(style);
            let fetched = esky.fetch_version(&name, &mut |status| progress.update(status));
            progress.finish();
            let path = fetched?;
            println!(
                "{}",
                render_status_line(style, "ok", &format!("prepared {name} at {}", path.display()))
            );
        }
        Commands::Install { version } => {
            let mut esky = open_esky(&global)?;
            let name = esky.version_name(&version)?;
            let installed = esky.install_version(&name)?;
            println!(
                "{}",
                render_status_line(style, "ok", &format!("installed {installed}"))
            );
        }
        Commands::Uninstall { version } => {
            let mut esky = open_esky(&global)?;
            let name = esky.version_name(&version)?;
            esky.uninstall_version(&name)?;
            println!(
                "{}",
                render_status_line(style, "ok", &format!("uninstalled {name}"))
            );
        }
        Commands::Cleanup => {
            let mut esky = open_esky(&global)?;
            let report = esky.cleanup()?;
            print_lines(&format_cleanup_lines(style, &report));
            if !report.is_clean() {
                return Ok(1);
            }
        }
        Commands::AutoUpdate => {
            let mut esky = open_esky(&global)?;
            let mut progress = FetchProgress::new(style);
            let updated = esky.auto_update(&mut |status| progress.update(status));
            progress.finish();
            match updated {
                Ok(Some(version)) => println!(
                    "{}",
                    render_status_line(style, "ok", &format!("updated to {version}"))
                ),
                Ok(None) => println!("{} is up to date", esky.app_name()),
                Err(err) => return Err(explain(style, err)),
            }
        }
    }

    Ok(0)
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

/// Adds a hint for the errors an operator can act on.
fn explain(style: OutputStyle, err: anyhow::Error) -> anyhow::Error {
    let hint = match EskyError::find(&err) {
        Some(EskyError::ElevationTimeout { .. }) => {
            "the elevated helper did not start; check the escalation wrapper"
        }
        Some(EskyError::PrivilegeRejected { .. }) => "the elevated helper refused the operation",
        Some(EskyError::NoUpdatePath { .. }) => "no published artifact leads to that version",
        _ => return err,
    };
    eprintln!("{}", render_status_line(style, "error", hint));
    err
}

fn open_esky(global: &GlobalArgs) -> Result<Esky> {
    let config = resolve_config(global)?;
    Ok(Esky::from_config(&config)?.with_helper_args(helper_args(global)?))
}

/// Loads the config file when there is one and applies command-line
/// overrides on top.
pub(crate) fn resolve_config(global: &GlobalArgs) -> Result<EskyConfig> {
    let path = EskyConfig::locate(global.config.as_deref());
    let mut config = if path.is_file() {
        EskyConfig::load(&path)?
    } else if global.config.is_some() || std::env::var_os(esky_app::CONFIG_ENV).is_some() {
        return Err(anyhow!("config file {} does not exist", path.display()));
    } else {
        let app_name = global.app_name.as_deref().ok_or_else(|| {
            anyhow!(
                "no {} found; pass --config or --app-name",
                esky_app::DEFAULT_CONFIG_FILE
            )
        })?;
        EskyConfig::new(app_name, global.app_root.clone().unwrap_or_else(|| PathBuf::from(".")))
    };

    if let Some(app_root) = &global.app_root {
        config.app_root = app_root.clone();
    }
    if let Some(app_name) = &global.app_name {
        config.app_name = app_name.clone();
    }
    if let Some(platform) = &global.platform {
        config.platform = Some(platform.clone());
    }
    if let Some(summary_url) = &global.summary_url {
        config.finder.summary_url = Some(summary_url.clone());
    }
    if let Some(strategy) = global.strategy {
        config.transaction.strategy = strategy.into();
    }
    Ok(config)
}

/// Arguments that make the helper see the same configuration as this
/// process.
pub(crate) fn helper_args(global: &GlobalArgs) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let path = EskyConfig::locate(global.config.as_deref());
    if path.is_file() {
        args.push("--config".to_string());
        args.push(absolute(&path)?.display().to_string());
    }
    if let Some(app_root) = &global.app_root {
        args.push("--app-root".to_string());
        args.push(absolute(app_root)?.display().to_string());
    }
    for (flag, value) in [
        ("--app-name", global.app_name.as_ref()),
        ("--platform", global.platform.as_ref()),
        ("--summary-url", global.summary_url.as_ref()),
    ] {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    }
    if let Some(strategy) = global.strategy {
        args.push("--strategy".to_string());
        args.push(TxnStrategy::from(strategy).as_str().to_string());
    }
    args.push("helper".to_string());
    Ok(args)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to read the working directory")?;
    Ok(cwd.join(path))
}
