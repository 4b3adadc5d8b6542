use super::*;
use anyhow::Result;
use esky_core::EskyError;
use esky_fstxn::snapshot_tree;
use serde_json::Value;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "esky-sudo-tests-{}-{}-{}",
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

/// Records every call and leaves a marker file for the mutating ones.
struct RecordingOps {
    root: PathBuf,
    calls: Vec<String>,
}

impl RecordingOps {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            calls: Vec::new(),
        }
    }

    fn touch(&self, name: &str) -> Result<()> {
        fs::write(self.root.join(name), name)?;
        Ok(())
    }
}

impl PrivilegedOps for RecordingOps {
    fn has_root(&mut self) -> Result<bool> {
        self.calls.push("has_root".to_string());
        Ok(false)
    }

    fn fetch_version(&mut self, version: &str) -> Result<PathBuf> {
        self.calls.push(format!("fetch_version {version}"));
        self.touch(&format!("fetched-{version}"))?;
        Ok(self.root.join(version))
    }

    fn install_version(&mut self, version: &str) -> Result<()> {
        self.calls.push(format!("install_version {version}"));
        self.touch(&format!("installed-{version}"))
    }

    fn uninstall_version(&mut self, version: &str) -> Result<()> {
        self.calls.push(format!("uninstall_version {version}"));
        self.touch(&format!("uninstalled-{version}"))
    }

    fn cleanup(&mut self) -> Result<()> {
        self.calls.push("cleanup".to_string());
        self.touch("cleaned")
    }
}

fn request_lines(requests: &[(&str, &[&str])]) -> String {
    requests
        .iter()
        .enumerate()
        .map(|(index, (operation, args))| {
            let request = Request {
                id: index as u64 + 1,
                operation: operation.to_string(),
                args: args.iter().map(|arg| arg.to_string()).collect(),
            };
            format!(
                "{}\n",
                serde_json::to_string(&request).expect("must encode request")
            )
        })
        .collect()
}

fn serve(ops: &mut RecordingOps, input: &str) -> (String, Vec<Response>) {
    let mut output = Vec::new();
    run_helper(ops, Cursor::new(input.as_bytes()), &mut output, "token-1")
        .expect("must serve requests");
    let mut reader = Cursor::new(output);
    let ready: Ready = read_message(&mut reader)
        .expect("must read ready line")
        .expect("must have ready line");
    let mut responses = Vec::new();
    while let Some(response) = read_message::<_, Response>(&mut reader).expect("must read response")
    {
        responses.push(response);
    }
    (ready.ready, responses)
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp() {
    let first = build_test_layout_path(42);
    let second = build_test_layout_path(42);
    assert_ne!(first, second);
}

#[test]
fn validate_accepts_allowed_calls() {
    let call = PrivilegedCall::validate("install_version", &args(&["1.2.0"]))
        .expect("must accept install");
    assert_eq!(call.name(), "install_version");
    assert_eq!(call.args(), args(&["1.2.0"]));
    assert_eq!(
        call.operation(),
        &Operation::InstallVersion {
            version: "1.2.0".to_string()
        }
    );
    assert_eq!(call.to_string(), "install_version(1.2.0)");

    let call = PrivilegedCall::validate("has_root", &[]).expect("must accept has_root");
    assert_eq!(call, PrivilegedCall::has_root());
    assert!(is_call_allowed("cleanup"));
    assert!(!is_call_allowed("rm"));
}

#[test]
fn validate_rejects_calls_outside_the_table() {
    let cases: &[(&str, &[&str])] = &[
        ("rm_rf", &["/"]),
        ("Install_Version", &["1.0"]),
        ("install_version", &["../evil"]),
        ("install_version", &["1.0/../../etc"]),
        ("install_version", &["1.*"]),
        ("install_version", &["*"]),
        ("install_version", &[""]),
        ("install_version", &["1.0 2.0"]),
        ("install_version", &[]),
        ("uninstall_version", &["1.0", "2.0"]),
        ("cleanup", &["now"]),
        ("has_root", &["yes"]),
    ];
    for (name, call_args) in cases {
        let err = PrivilegedCall::validate(name, &args(call_args))
            .expect_err("must reject call outside the table");
        match EskyError::find(&err) {
            Some(EskyError::PrivilegeRejected { operation, .. }) => {
                assert_eq!(operation, name);
            }
            other => panic!("expected PrivilegeRejected for {name} {call_args:?}, got {other:?}"),
        }
    }
}

#[test]
fn helper_rejects_disallowed_calls_without_side_effects() {
    let dir = test_dir();
    fs::write(dir.join("existing.txt"), "keep").expect("must seed dir");
    let before = snapshot_tree(&dir).expect("must snapshot before");

    let mut ops = RecordingOps::new(dir.clone());
    let input = request_lines(&[
        ("delete_everything", &[]),
        ("install_version", &["../evil"]),
        ("install_version", &["1.*"]),
        ("fetch_version", &["1.0", "extra"]),
        ("cleanup", &["--force"]),
    ]);
    let (ready, responses) = serve(&mut ops, &input);

    assert_eq!(ready, "token-1");
    assert_eq!(responses.len(), 5);
    for (index, response) in responses.iter().enumerate() {
        assert_eq!(response.id, index as u64 + 1);
        assert!(!response.ok, "request {} must be rejected", response.id);
        assert_eq!(response.kind.as_deref(), Some("privilege_rejected"));
    }
    assert!(ops.calls.is_empty(), "no privileged op may run: {:?}", ops.calls);
    assert_eq!(snapshot_tree(&dir).expect("must snapshot after"), before);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn helper_dispatches_allowed_calls() {
    let dir = test_dir();
    let mut ops = RecordingOps::new(dir.clone());
    let input = request_lines(&[
        ("has_root", &[]),
        ("install_version", &["1.2"]),
        ("fetch_version", &["1.3"]),
        ("cleanup", &[]),
    ]);
    let (_, responses) = serve(&mut ops, &input);

    assert_eq!(
        ops.calls,
        vec![
            "has_root".to_string(),
            "install_version 1.2".to_string(),
            "fetch_version 1.3".to_string(),
            "cleanup".to_string(),
        ]
    );
    assert!(responses.iter().all(|response| response.ok));
    assert_eq!(responses[0].value, Some(Value::Bool(false)));
    assert_eq!(
        responses[2].value,
        Some(Value::String(dir.join("1.3").display().to_string()))
    );
    assert!(dir.join("installed-1.2").exists());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn helper_answers_malformed_lines_and_keeps_serving() {
    let dir = test_dir();
    let mut ops = RecordingOps::new(dir.clone());
    let input = format!(
        "not json\n\n{}",
        request_lines(&[("uninstall_version", &["2.0"])])
    );
    let (_, responses) = serve(&mut ops, &input);

    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].id, 0);
    assert_eq!(responses[0].kind.as_deref(), Some("privilege_rejected"));
    assert!(responses[1].ok);
    assert_eq!(ops.calls, vec!["uninstall_version 2.0".to_string()]);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn helper_reports_failed_operations() {
    struct FailingOps;

    impl PrivilegedOps for FailingOps {
        fn has_root(&mut self) -> Result<bool> {
            Ok(true)
        }
        fn fetch_version(&mut self, _version: &str) -> Result<PathBuf> {
            anyhow::bail!("network down")
        }
        fn install_version(&mut self, _version: &str) -> Result<()> {
            Ok(())
        }
        fn uninstall_version(&mut self, _version: &str) -> Result<()> {
            Ok(())
        }
        fn cleanup(&mut self) -> Result<()> {
            Ok(())
        }
    }

    let mut output = Vec::new();
    let input = request_lines(&[("fetch_version", &["3.0"])]);
    run_helper(&mut FailingOps, Cursor::new(input), &mut output, "t")
        .expect("must serve requests");
    let text = String::from_utf8(output).expect("must be utf-8");
    let response: Response = serde_json::from_str(text.lines().nth(1).expect("must respond"))
        .expect("must decode response");
    assert!(!response.ok);
    assert_eq!(response.kind.as_deref(), Some("failed"));
    assert!(response
        .error
        .as_deref()
        .is_some_and(|error| error.contains("network down")));
}

#[cfg(unix)]
fn sh_helper(script: &str, timeout_ms: u64) -> SpawnConfig {
    let mut config = SpawnConfig::new("sh");
    config.args = args(&["-c", script]);
    config.ready_timeout = std::time::Duration::from_millis(timeout_ms);
    config
}

#[cfg(unix)]
#[test]
fn spawn_times_out_when_helper_never_becomes_ready() {
    let started = std::time::Instant::now();
    let err = match HelperClient::spawn(&sh_helper("exec sleep 5", 200)) {
        Ok(_) => panic!("silent helper must not be accepted"),
        Err(err) => err,
    };
    assert!(matches!(
        EskyError::find(&err),
        Some(EskyError::ElevationTimeout { .. })
    ));
    assert!(started.elapsed() < std::time::Duration::from_secs(4));
}

#[cfg(unix)]
#[test]
fn spawn_waits_for_the_ready_token_and_calls_through() {
    // `sh -c script --token TOKEN` puts the token in $1
    let script = r#"printf '{"ready":"%s"}\n' "$1"
read request
printf '{"id":1,"ok":true,"value":true}\n'
read request
printf '{"id":2,"ok":false,"error":"not on the list","kind":"privilege_rejected"}\n'
read request"#;
    let mut client =
        HelperClient::spawn(&sh_helper(script, 5_000)).expect("must spawn script helper");

    let value = client
        .call(&PrivilegedCall::has_root())
        .expect("must call has_root");
    assert_eq!(value, Value::Bool(true));

    let err = client
        .call(&PrivilegedCall::cleanup())
        .expect_err("rejection must surface as an error");
    assert!(matches!(
        EskyError::find(&err),
        Some(EskyError::PrivilegeRejected { .. })
    ));

    client.shutdown().expect("must shut helper down");
}

#[cfg(unix)]
#[test]
fn spawn_refuses_a_wrong_ready_token() {
    let err = match HelperClient::spawn(&sh_helper(
        r#"printf '{"ready":"guess"}\n'; read request"#,
        5_000,
    )) {
        Ok(_) => panic!("wrong token must not be accepted"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("wrong ready token"));
}

#[cfg(unix)]
#[test]
fn drop_root_is_a_no_op_outside_sudo() {
    if std::env::var_os("SUDO_UID").is_some() {
        return;
    }
    assert!(!drop_root().expect("must not fail outside sudo"));
}

#[cfg(unix)]
#[test]
fn helper_that_cannot_be_signalled_is_left_behind_after_the_grace_period() {
    let mut child = std::process::Command::new("sh")
        .args(["-c", "exec sleep 5"])
        .stdin(std::process::Stdio::piped())
        .spawn()
        .expect("must spawn sleeper");
    let stdin = child.stdin.take();
    let started = std::time::Instant::now();

    let stopped = crate::client::stop_child(
        &mut child,
        stdin,
        |_| Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
        std::time::Duration::from_millis(200),
    );

    assert!(!stopped);
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
    child.kill().expect("must kill leftover sleeper");
    child.wait().expect("must reap leftover sleeper");
}

#[cfg(unix)]
#[test]
fn signalled_helper_is_reaped() {
    let mut child = std::process::Command::new("sh")
        .args(["-c", "exec sleep 5"])
        .stdin(std::process::Stdio::piped())
        .spawn()
        .expect("must spawn sleeper");
    let stdin = child.stdin.take();

    assert!(crate::client::stop_child(
        &mut child,
        stdin,
        std::process::Child::kill,
        std::time::Duration::from_secs(2),
    ));
}

#[cfg(unix)]
#[test]
fn watchdog_sees_whether_the_app_process_is_alive() {
    assert!(crate::helper::process_alive(std::process::id()));

    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("must spawn true");
    let pid = child.id();
    child.wait().expect("must reap true");
    assert!(!crate::helper::process_alive(pid));
}
