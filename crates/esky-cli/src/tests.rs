use super::*;
use crate::completion::write_completions_script;
use crate::dispatch::{helper_args, resolve_config};
use crate::render::{progress_line, render_status_line, resolve_output_style, OutputStyle};
use clap::error::ErrorKind;
use clap::CommandFactory;
use esky_finder::{DownloadPhase, DownloadStatus};
use esky_fstxn::{copy_dir_recursive, snapshot_tree, TxnStrategy};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "esky-cli-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path
}

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let path = build_test_layout_path(nanos);
    fs::create_dir_all(&path).expect("must create test dir");
    path
}

fn write(path: &Path, data: &[u8]) {
    fs::create_dir_all(path.parent().expect("must have parent")).expect("must create parent");
    fs::write(path, data).expect("must write file");
}

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).expect("must parse arguments")
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp() {
    let first = build_test_layout_path(99);
    let second = build_test_layout_path(99);
    assert_ne!(first, second);
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let cli = parse(&[
        "esky",
        "install",
        "2.0",
        "--app-root",
        "/opt/demo",
        "--strategy",
        "staged",
    ]);
    assert!(matches!(cli.command, Commands::Install { ref version } if version == "2.0"));
    assert_eq!(cli.global.app_root, Some(PathBuf::from("/opt/demo")));
    assert_eq!(cli.global.strategy, Some(CliStrategy::Staged));
}

#[test]
fn helper_subcommand_is_hidden_and_requires_a_token() {
    let help = Cli::command().render_help().to_string();
    assert!(!help.contains("helper"));

    let cli = parse(&["esky", "helper", "--token", "abc", "--parent", "4242"]);
    assert!(matches!(
        cli.command,
        Commands::Helper { ref token, parent: Some(4242) } if token == "abc"
    ));

    let err = Cli::try_parse_from(["esky", "helper"]).expect_err("token is required");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn bootstrap_forwards_arguments_verbatim() {
    let cli = parse(&["esky", "bootstrap", "--", "--version", "-x", "file"]);
    let Commands::Bootstrap { args } = cli.command else {
        panic!("expected bootstrap command");
    };
    assert_eq!(args, vec!["--version", "-x", "file"]);
}

#[test]
fn completions_script_names_the_binary() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output)
        .expect("must write completions");
    let script = String::from_utf8(output).expect("must be utf-8");
    assert!(script.contains("esky"));
    assert!(script.contains("auto-update"));
}

#[test]
fn resolve_output_style_follows_stdout() {
    assert_eq!(resolve_output_style(true, false), OutputStyle::Rich);
    assert_eq!(resolve_output_style(false, true), OutputStyle::Plain);
}

#[test]
fn plain_lines_carry_no_escape_codes() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "installed demo-2.0-linux-x86_64"),
        "ok: installed demo-2.0-linux-x86_64"
    );
    let rich = render_status_line(OutputStyle::Rich, "ok", "done");
    assert!(rich.contains('\u{1b}'));
    assert!(rich.ends_with("done"));

    let line = progress_line(&DownloadStatus {
        fetched: 1024,
        total: Some(2048),
        file: "demo-2.0.zip".to_string(),
        phase: DownloadPhase::Downloading,
    });
    assert!(line.starts_with("downloading demo-2.0.zip"));
}

#[test]
fn command_line_overrides_the_config_file() {
    let dir = test_dir();
    let config_path = dir.join("esky.toml");
    write(
        &config_path,
        b"app_name = \"demo\"\napp_root = \"apps\"\n[transaction]\nstrategy = \"direct\"\n",
    );
    let global = GlobalArgs {
        config: Some(config_path.clone()),
        platform: Some("testos-arm64".to_string()),
        strategy: Some(CliStrategy::Staged),
        ..GlobalArgs::default()
    };

    let config = resolve_config(&global).expect("must resolve config");
    assert_eq!(config.app_name, "demo");
    assert_eq!(config.app_root, dir.join("apps"));
    assert_eq!(config.platform(), "testos-arm64");
    assert_eq!(config.transaction.strategy, TxnStrategy::Staged);

    let args = helper_args(&global).expect("must build helper args");
    assert_eq!(args.first().map(String::as_str), Some("--config"));
    assert_eq!(args.get(1), Some(&config_path.display().to_string()));
    assert!(args.windows(2).any(|pair| pair == ["--platform", "testos-arm64"]));
    assert!(args.windows(2).any(|pair| pair == ["--strategy", "staged"]));
    assert_eq!(args.last().map(String::as_str), Some("helper"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn missing_explicit_config_is_an_error() {
    let dir = test_dir();
    let global = GlobalArgs {
        config: Some(dir.join("absent.toml")),
        ..GlobalArgs::default()
    };
    let err = resolve_config(&global).expect_err("absent config must fail");
    assert!(err.to_string().contains("does not exist"));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn diff_and_patch_commands_reproduce_the_target_tree() {
    let dir = test_dir();
    let source = dir.join("source");
    let target = dir.join("target");
    write(&source.join("app/main.txt"), b"version one\n");
    write(&source.join("app/old.txt"), b"going away\n");
    write(&target.join("app/main.txt"), b"version two\n");
    write(&target.join("app/new/data.bin"), &[0_u8, 1, 2, 3, 255]);

    let patch = dir.join("one-to-two.patch");
    let code = dispatch::run_cli(parse(&[
        "esky",
        "diff",
        &source.display().to_string(),
        &target.display().to_string(),
        &patch.display().to_string(),
    ]))
    .expect("must diff trees");
    assert_eq!(code, 0);

    let work = dir.join("work");
    copy_dir_recursive(&source, &work).expect("must copy source");
    dispatch::run_cli(parse(&[
        "esky",
        "patch",
        &patch.display().to_string(),
        &work.display().to_string(),
    ]))
    .expect("must apply patch");

    assert_eq!(
        snapshot_tree(&work).expect("must snapshot work"),
        snapshot_tree(&target).expect("must snapshot target")
    );

    let _ = fs::remove_dir_all(&dir);
}
