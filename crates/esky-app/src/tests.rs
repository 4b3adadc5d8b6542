use super::*;
use anyhow::Result;
use esky_core::{EskyError, VersionName};
use esky_finder::{DownloadStatus, FetchIter, FinderContext, SummaryVersionFinder, VersionFinder};
use esky_fstxn::{snapshot_tree, TxnStrategy};
use esky_patch::{build_container, EntryCompression};
use esky_security::sha256_hex;
use esky_sudo::{run_helper, Request, Response, SpawnConfig};
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

const APP: &str = "demo";
const PLATFORM: &str = "testos-x86_64";

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "esky-app-tests-{}-{}-{}",
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
    path.canonicalize().expect("must canonicalize test dir")
}

fn write(path: &Path, data: &[u8]) {
    fs::create_dir_all(path.parent().expect("must have parent")).expect("must create parent");
    fs::write(path, data).expect("must write file");
}

fn version_name(version: &str) -> VersionName {
    VersionName::new(APP, version, PLATFORM).expect("must build version name")
}

fn seed_installed(app_root: &Path, version: &str) {
    let dir = app_root.join(version_name(version).dir_name());
    write(&dir.join("demo"), format!("payload {version}").as_bytes());
    write(&dir.join("esky-files/bootstrap-manifest.txt"), b"demo\n");
    write(&dir.join("esky-files/esky-lockfile.txt"), b"");
    write(
        &dir.join("esky-files/bootstrap/demo"),
        format!("stub {version}").as_bytes(),
    );
}

/// Publishes a full archive of `version` and a summary listing it.
fn publish_full(dir: &Path, version: &str) -> String {
    let name = version_name(version).dir_name();
    let archive = build_container(
        vec![
            (format!("{name}/"), Vec::new()),
            (format!("{name}/demo"), format!("payload {version}").into_bytes()),
            ("demo".to_string(), format!("stub {version}").into_bytes()),
        ],
        EntryCompression::Deflated,
    )
    .expect("must build archive");
    let archive_path = dir.join(format!("{name}.zip"));
    write(&archive_path, &archive);

    let summary_path = dir.join("summary.txt");
    write(
        &summary_path,
        format!(
            "{APP} {PLATFORM} {version} * file://{} {} {}\n",
            archive_path.display(),
            archive.len(),
            sha256_hex(&archive)
        )
        .as_bytes(),
    );
    format!("file://{}", summary_path.display())
}

fn esky_with_summary(app_root: &Path, summary_url: &str) -> Esky {
    Esky::new(app_root, APP)
        .with_platform(PLATFORM)
        .with_strategy(TxnStrategy::Staged)
        .with_finder(Box::new(SummaryVersionFinder::new(summary_url)))
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp() {
    let first = build_test_layout_path(7);
    let second = build_test_layout_path(7);
    assert_ne!(first, second);
}

#[test]
fn config_parses_every_section() {
    let config = EskyConfig::from_toml_str(
        r#"
app_name = "demo"
platform = "linux-x86_64"
app_root = "/opt/demo"

[finder]
summary_url = "https://updates.example.com/demo/summary.txt"
public_key_hex = "00ff"

[transaction]
strategy = "staged"

[escalation]
enabled = true
wrapper = ["sudo", "-n"]
helper_program = "/opt/demo/esky"
ready_timeout_secs = 5
"#,
    )
    .expect("must parse config");

    assert_eq!(config.app_name, "demo");
    assert_eq!(config.platform(), "linux-x86_64");
    assert_eq!(config.app_root, PathBuf::from("/opt/demo"));
    assert_eq!(
        config.finder.summary_url.as_deref(),
        Some("https://updates.example.com/demo/summary.txt")
    );
    assert_eq!(config.transaction.strategy, TxnStrategy::Staged);
    assert!(config.escalation.enabled);
    assert_eq!(config.escalation.wrapper, vec!["sudo", "-n"]);
    assert_eq!(config.escalation.ready_timeout(), Duration::from_secs(5));
}

#[test]
fn config_defaults_optional_sections() {
    let config = EskyConfig::from_toml_str("app_name = \"demo\"\napp_root = \"apps\"\n")
        .expect("must parse minimal config");
    assert_eq!(config, EskyConfig::new("demo", "apps"));
    assert_eq!(config.transaction.strategy, TxnStrategy::Auto);
    assert!(!config.escalation.enabled);
    assert_eq!(config.escalation.ready_timeout_secs, 30);
    assert_eq!(config.platform(), esky_core::host_platform());
}

#[test]
fn config_rejects_unknown_keys_and_bad_names() {
    let unknown = EskyConfig::from_toml_str(
        "app_name = \"demo\"\napp_root = \"/a\"\n[finder]\nsummary = \"x\"\n",
    )
    .expect_err("unknown key must fail");
    assert!(format!("{unknown:#}").contains("failed to parse esky config"));

    let empty = EskyConfig::from_toml_str("app_name = \" \"\napp_root = \"/a\"\n")
        .expect_err("empty app name must fail");
    assert!(empty.to_string().contains("app_name must not be empty"));

    let nested = EskyConfig::from_toml_str("app_name = \"a/b\"\napp_root = \"/a\"\n")
        .expect_err("separator must fail");
    assert!(nested.to_string().contains("path separators"));

    let strategy = EskyConfig::from_toml_str(
        "app_name = \"demo\"\napp_root = \"/a\"\n[transaction]\nstrategy = \"yolo\"\n",
    );
    assert!(strategy.is_err());
}

#[test]
fn load_resolves_app_root_next_to_the_file() {
    let dir = test_dir();
    let path = dir.join("esky.toml");
    write(&path, b"app_name = \"demo\"\napp_root = \"apps\"\n");

    let config = EskyConfig::load(&path).expect("must load config");
    assert_eq!(config.app_root, dir.join("apps"));
    assert_eq!(EskyConfig::locate(Some(path.as_path())), path);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn auto_update_installs_activates_and_cleans_up() {
    let dir = test_dir();
    let app_root = dir.join("app");
    seed_installed(&app_root, "1.0");
    let summary = publish_full(&dir.join("server"), "2.0");

    let mut esky = esky_with_summary(&app_root, &summary);
    assert_eq!(
        esky.active_version().expect("must read active"),
        Some(version_name("1.0"))
    );

    let mut statuses: Vec<DownloadStatus> = Vec::new();
    let updated = esky
        .auto_update(&mut |status| statuses.push(status.clone()))
        .expect("must auto update");

    assert_eq!(updated, Some(version_name("2.0")));
    assert!(!statuses.is_empty());
    assert_eq!(
        esky.active_version().expect("must read active"),
        Some(version_name("2.0"))
    );
    let new_dir = app_root.join(version_name("2.0").dir_name());
    assert_eq!(
        fs::read_to_string(new_dir.join("demo")).expect("must read payload"),
        "payload 2.0"
    );
    assert_eq!(
        fs::read_to_string(app_root.join("demo")).expect("must read bootstrap stub"),
        "stub 2.0"
    );
    assert!(
        !app_root.join(version_name("1.0").dir_name()).exists(),
        "old version must be cleaned up"
    );
    assert!(!esky.needs_cleanup().expect("must check cleanup"));

    let again = esky.auto_update(&mut |_| {}).expect("must check again");
    assert_eq!(again, None);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn install_without_prepared_tree_reports_missing_version() {
    let dir = test_dir();
    let summary = publish_full(&dir.join("server"), "2.0");
    let mut esky = esky_with_summary(&dir.join("app"), &summary);

    let err = esky
        .install_version(&version_name("2.0"))
        .expect_err("install without fetch must fail");
    assert!(matches!(
        EskyError::find(&err),
        Some(EskyError::VersionNotFound { .. })
    ));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn find_update_without_source_is_an_error() {
    let dir = test_dir();
    let mut esky = Esky::new(dir.join("app"), APP).with_platform(PLATFORM);
    let err = esky.find_update().expect_err("no finder must fail");
    assert!(err.to_string().contains("no update source configured"));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn helper_serves_esky_operations_through_the_allow_list() {
    let dir = test_dir();
    let app_root = dir.join("app");
    seed_installed(&app_root, "1.0");
    seed_installed(&app_root, "1.1");
    let mut esky = Esky::new(&app_root, APP).with_platform(PLATFORM);

    let before = snapshot_tree(&app_root).expect("must snapshot before");
    let lines = [
        Request {
            id: 1,
            operation: "uninstall_version".to_string(),
            args: vec!["../../etc".to_string()],
        },
        Request {
            id: 2,
            operation: "remove_everything".to_string(),
            args: Vec::new(),
        },
    ]
    .iter()
    .map(|request| serde_json::to_string(request).expect("must encode") + "\n")
    .collect::<String>();
    let mut output = Vec::new();
    run_helper(&mut esky, Cursor::new(lines), &mut output, "tok").expect("must serve");
    assert_eq!(
        snapshot_tree(&app_root).expect("must snapshot after"),
        before,
        "rejected calls must not touch the app root"
    );

    let request = Request {
        id: 3,
        operation: "uninstall_version".to_string(),
        args: vec!["1.0".to_string()],
    };
    let mut output = Vec::new();
    run_helper(
        &mut esky,
        Cursor::new(serde_json::to_string(&request).expect("must encode") + "\n"),
        &mut output,
        "tok",
    )
    .expect("must serve");
    let text = String::from_utf8(output).expect("must be utf-8");
    let response: Response =
        serde_json::from_str(text.lines().nth(1).expect("must answer")).expect("must decode");
    assert!(response.ok, "uninstall must succeed: {response:?}");
    assert!(!app_root.join(version_name("1.0").dir_name()).exists());
    assert!(app_root.join(version_name("1.1").dir_name()).exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn permission_errors_are_found_anywhere_in_the_chain() {
    let denied = anyhow::Error::new(io::Error::from(io::ErrorKind::PermissionDenied))
        .context("failed to create /opt/demo/updates");
    assert!(is_permission_error(&denied));

    let missing = anyhow::Error::new(io::Error::from(io::ErrorKind::NotFound))
        .context("failed to read summary");
    assert!(!is_permission_error(&missing));
}

/// Offers one version and fails every fetch with a permission error.
struct DeniedFinder;

impl VersionFinder for DeniedFinder {
    fn find_versions(&mut self, _ctx: &FinderContext) -> Result<Vec<VersionName>> {
        Ok(vec![version_name("2.0")])
    }

    fn fetch_version_iter<'a>(
        &'a mut self,
        _ctx: &'a FinderContext,
        _version: &VersionName,
    ) -> FetchIter<'a> {
        Box::new(std::iter::once(Err(anyhow::Error::new(io::Error::from(
            io::ErrorKind::PermissionDenied,
        ))
        .context("failed to create updates directory"))))
    }

    fn has_version(
        &self,
        _ctx: &FinderContext,
        _version: &VersionName,
    ) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn needs_cleanup(&self, _ctx: &FinderContext) -> Result<bool> {
        Ok(false)
    }

    fn cleanup(&mut self, _ctx: &FinderContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
#[test]
fn auto_update_escalates_remaining_steps_on_permission_error() {
    if std::env::var_os("SUDO_UID").is_some() {
        return;
    }
    let dir = test_dir();
    let log = dir.join("helper.log");
    // `sh -c script --token TOKEN` puts the token in $1
    let script = format!(
        r#"printf '{{"ready":"%s"}}\n' "$1"
n=0
while read request; do
  n=$((n+1))
  printf '%s\n' "$request" >> '{}'
  printf '{{"id":%d,"ok":true}}\n' "$n"
done"#,
        log.display()
    );
    let mut spawn = SpawnConfig::new("sh");
    spawn.args = vec!["-c".to_string(), script];
    spawn.ready_timeout = Duration::from_secs(5);

    let mut esky = Esky::new(dir.join("app"), APP)
        .with_platform(PLATFORM)
        .with_finder(Box::new(DeniedFinder))
        .with_escalation(Some(spawn));
    let updated = esky.auto_update(&mut |_| {}).expect("must update through helper");
    assert_eq!(updated, Some(version_name("2.0")));
    assert_eq!(
        esky.manager().designated_active(),
        Some(&version_name("2.0"))
    );

    let requests = fs::read_to_string(&log)
        .expect("must read helper log")
        .lines()
        .map(|line| serde_json::from_str::<Request>(line).expect("must decode request"))
        .map(|request| (request.operation, request.args))
        .collect::<Vec<_>>();
    assert_eq!(
        requests,
        vec![
            ("fetch_version".to_string(), vec!["2.0".to_string()]),
            ("install_version".to_string(), vec!["2.0".to_string()]),
            ("cleanup".to_string(), Vec::new()),
        ]
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn auto_update_without_escalation_surfaces_permission_errors() {
    let dir = test_dir();
    let mut esky = Esky::new(dir.join("app"), APP)
        .with_platform(PLATFORM)
        .with_finder(Box::new(DeniedFinder));
    let err = esky
        .auto_update(&mut |_| {})
        .expect_err("permission error must surface");
    assert!(is_permission_error(&err));
    let _ = fs::remove_dir_all(&dir);
}
