use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Result;
use esky_core::EskyError;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::allowlist::{Operation, PrivilegedCall, SECURITY_TARGET};
use crate::protocol::{
    read_message, write_message, Ready, Request, Response, KIND_FAILED, KIND_REJECTED,
};

/// What the elevated side is able to do. Only reached through a
/// [`PrivilegedCall`] that passed the allow-list.
pub trait PrivilegedOps {
    fn has_root(&mut self) -> Result<bool>;
    fn fetch_version(&mut self, version: &str) -> Result<PathBuf>;
    fn install_version(&mut self, version: &str) -> Result<()>;
    fn uninstall_version(&mut self, version: &str) -> Result<()>;
    fn cleanup(&mut self) -> Result<()>;
}

/// Runs `call` against `ops` and encodes the result for the wire.
pub fn dispatch(ops: &mut dyn PrivilegedOps, call: &PrivilegedCall) -> Result<Value> {
    info!(call = %call, "running privileged call");
    match call.operation() {
        Operation::HasRoot => ops.has_root().map(Value::Bool),
        Operation::FetchVersion { version } => ops
            .fetch_version(version)
            .map(|path| json!(path.display().to_string())),
        Operation::InstallVersion { version } => {
            ops.install_version(version).map(|()| Value::Null)
        }
        Operation::UninstallVersion { version } => {
            ops.uninstall_version(version).map(|()| Value::Null)
        }
        Operation::Cleanup => ops.cleanup().map(|()| Value::Null),
    }
}

/// Serves requests from `input` until it closes. The ready line carrying
/// `token` goes out before the first request is read.
pub fn run_helper<R: BufRead, W: Write>(
    ops: &mut dyn PrivilegedOps,
    mut input: R,
    mut output: W,
    token: &str,
) -> Result<()> {
    write_message(
        &mut output,
        &Ready {
            ready: token.to_string(),
        },
    )?;
    debug!("helper ready");

    loop {
        let request = match read_message::<_, Request>(&mut input) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("helper input closed");
                return Ok(());
            }
            Err(err) => {
                warn!(target: SECURITY_TARGET, error = %format!("{err:#}"), "dropped malformed request");
                write_message(&mut output, &Response::failure(0, KIND_REJECTED, format!("{err:#}")))?;
                continue;
            }
        };

        let response = match PrivilegedCall::validate(&request.operation, &request.args) {
            Err(err) => Response::failure(request.id, KIND_REJECTED, format!("{err:#}")),
            Ok(call) => match dispatch(ops, &call) {
                Ok(value) => Response::success(request.id, value),
                Err(err) => {
                    warn!(call = %call, error = %format!("{err:#}"), "privileged call failed");
                    let kind = match EskyError::find(&err) {
                        Some(EskyError::PrivilegeRejected { .. }) => KIND_REJECTED,
                        _ => KIND_FAILED,
                    };
                    Response::failure(request.id, kind, format!("{err:#}"))
                }
            },
        };
        write_message(&mut output, &response)?;
    }
}

/// Entry point of the helper process: serves stdin/stdout and exits when the
/// app goes away.
///
/// Stdin EOF is the liveness channel. `parent` is the pid of the app that
/// spawned the helper through any wrapper; the watchdog exits once it is
/// gone. Without it the watchdog falls back to the immediate parent, which
/// under `sudo` is the wrapper rather than the app.
pub fn helper_main(ops: &mut dyn PrivilegedOps, token: &str, parent: Option<u32>) -> Result<()> {
    spawn_parent_watchdog(parent);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_helper(ops, stdin.lock(), stdout.lock(), token)
}

#[cfg(unix)]
fn spawn_parent_watchdog(app: Option<u32>) {
    use std::thread;
    use std::time::Duration;

    let parent = std::os::unix::process::parent_id();
    let spawned = thread::Builder::new()
        .name("esky-helper-watchdog".to_string())
        .spawn(move || loop {
            thread::sleep(Duration::from_millis(500));
            let gone = match app {
                Some(pid) => !process_alive(pid),
                None => std::os::unix::process::parent_id() != parent,
            };
            if gone {
                warn!(parent = app.unwrap_or(parent), "parent process went away; helper exiting");
                std::process::exit(1);
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to start helper watchdog");
    }
}

#[cfg(not(unix))]
fn spawn_parent_watchdog(_app: Option<u32>) {}

/// Whether `pid` names a live process. A process owned by someone else
/// still counts as alive.
#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}
