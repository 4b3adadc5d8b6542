use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use esky_core::EskyError;
use esky_security::sha256_hex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::allowlist::PrivilegedCall;
use crate::protocol::{read_message, write_message, Request, Response, KIND_REJECTED};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a helper that is being abandoned may take to exit.
const ABANDON_GRACE: Duration = Duration::from_secs(2);
/// How long a helper may take to exit once its stdin is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const REAP_POLL: Duration = Duration::from_millis(20);

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How to start the elevated helper.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Argv prefix run before the helper, such as `["sudo", "-n"]`.
    pub wrapper: Vec<String>,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub ready_timeout: Duration,
}

impl SpawnConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            wrapper: Vec::new(),
            program: program.into(),
            args: Vec::new(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    fn command(&self, token: &str) -> Command {
        let mut command = match self.wrapper.split_first() {
            Some((wrapper, wrapper_args)) => {
                let mut command = Command::new(wrapper);
                command.args(wrapper_args).arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };
        command
            .args(&self.args)
            .arg("--token")
            .arg(token)
            .arg("--parent")
            .arg(std::process::id().to_string());
        command
    }
}

enum HelperLine {
    Ready(String),
    Response(Response),
}

/// The unprivileged end of the escalation channel. Owns the helper process;
/// dropping the client closes its stdin, which ends the helper.
pub struct HelperClient {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<Result<HelperLine>>,
    next_id: u64,
}

impl HelperClient {
    /// Starts the helper and blocks until it echoes the spawn token or the
    /// ready timeout expires. On timeout the child is killed, or left behind
    /// when it cannot be signalled (a root-owned `sudo`).
    pub fn spawn(config: &SpawnConfig) -> Result<Self> {
        let token = spawn_token();
        let mut command = config.command(&token);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        debug!(program = %config.program.display(), wrapper = ?config.wrapper, "spawning helper");
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn helper {}", config.program.display()))?;

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let stdin = child.stdin.take();
                stop_child(&mut child, stdin, Child::kill, ABANDON_GRACE);
                bail!("helper {} has no stdout pipe", config.program.display());
            }
        };
        let stdin = child.stdin.take();

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("esky-helper-reader".to_string())
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                loop {
                    let line = match read_message::<_, Value>(&mut stdout) {
                        Ok(Some(value)) => decode_line(value),
                        Ok(None) => break,
                        Err(err) => Err(err),
                    };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .context("failed to start helper reader thread")?;

        let mut client = Self {
            child,
            stdin,
            lines: rx,
            next_id: 1,
        };
        client.wait_ready(&token, config.ready_timeout)?;
        info!(program = %config.program.display(), "helper ready");
        Ok(client)
    }

    fn wait_ready(&mut self, token: &str, timeout: Duration) -> Result<()> {
        match self.lines.recv_timeout(timeout) {
            Ok(Ok(HelperLine::Ready(echoed))) if echoed == token => Ok(()),
            Ok(Ok(HelperLine::Ready(_))) => {
                self.abandon();
                bail!("helper answered with the wrong ready token")
            }
            Ok(Ok(HelperLine::Response(_))) => {
                self.abandon();
                bail!("helper answered before announcing readiness")
            }
            Ok(Err(err)) => {
                self.abandon();
                Err(err.context("helper failed before becoming ready"))
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(seconds = timeout.as_secs(), "helper did not become ready");
                self.abandon();
                Err(EskyError::ElevationTimeout {
                    seconds: timeout.as_secs(),
                }
                .into())
            }
            Err(RecvTimeoutError::Disconnected) => {
                let status = reap_within(&mut self.child, ABANDON_GRACE);
                bail!("helper exited before becoming ready ({status:?})")
            }
        }
    }

    fn abandon(&mut self) {
        let stdin = self.stdin.take();
        stop_child(&mut self.child, stdin, Child::kill, ABANDON_GRACE);
    }

    /// Sends `call` and waits for its response. Rejections come back as
    /// [`EskyError::PrivilegeRejected`].
    pub fn call(&mut self, call: &PrivilegedCall) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let request = Request {
            id,
            operation: call.name().to_string(),
            args: call.args(),
        };
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("helper channel is closed"))?;
        write_message(stdin, &request)?;
        debug!(call = %call, id, "sent privileged call");

        loop {
            let line = match self.lines.recv() {
                Ok(line) => line?,
                Err(_) => bail!("helper exited while running {call}"),
            };
            let HelperLine::Response(response) = line else {
                continue;
            };
            if response.id != id {
                warn!(expected = id, got = response.id, "discarding stray helper response");
                continue;
            }
            return into_result(call, response);
        }
    }

    /// Closes the channel and waits a bounded time for the helper to exit.
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };
        let _ = stdin.flush();
        drop(stdin);
        match reap_within(&mut self.child, SHUTDOWN_GRACE) {
            Some(status) => debug!(status = %status, "helper exited"),
            None => warn!(pid = self.child.id(), "helper did not exit after its channel closed"),
        }
        Ok(())
    }
}

impl Drop for HelperClient {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %format!("{err:#}"), "failed to shut helper down");
        }
    }
}

fn decode_line(value: Value) -> Result<HelperLine> {
    if let Some(token) = value.get("ready").and_then(Value::as_str) {
        return Ok(HelperLine::Ready(token.to_string()));
    }
    serde_json::from_value(value)
        .map(HelperLine::Response)
        .context("helper sent an unknown message")
}

fn into_result(call: &PrivilegedCall, response: Response) -> Result<Value> {
    if response.ok {
        return Ok(response.value.unwrap_or(Value::Null));
    }
    let reason = response
        .error
        .unwrap_or_else(|| "helper gave no reason".to_string());
    if response.kind.as_deref() == Some(KIND_REJECTED) {
        return Err(EskyError::PrivilegeRejected {
            operation: call.name().to_string(),
            reason,
        }
        .into());
    }
    Err(anyhow!(reason).context(format!("privileged {call} failed")))
}

/// Closes the child's stdin, signals it with `kill` and waits at most
/// `grace` for it to exit. Returns false when the child was left running.
pub(crate) fn stop_child(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    kill: impl FnOnce(&mut Child) -> io::Result<()>,
    grace: Duration,
) -> bool {
    drop(stdin);
    if let Err(err) = kill(child) {
        debug!(error = %err, "could not signal helper");
    }
    match reap_within(child, grace) {
        Some(status) => {
            debug!(status = %status, "helper stopped");
            true
        }
        None => {
            warn!(pid = child.id(), "helper is still running; leaving it behind");
            false
        }
    }
}

fn reap_within(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(REAP_POLL),
            Ok(None) => return None,
            Err(err) => {
                debug!(error = %err, "failed to poll helper");
                return None;
            }
        }
    }
}

fn spawn_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let sequence = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    sha256_hex(format!("{}-{nanos}-{sequence}", std::process::id()).as_bytes())
}
