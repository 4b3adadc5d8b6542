mod allowlist;
mod client;
mod helper;
mod privileges;
mod protocol;

pub use allowlist::{is_call_allowed, Operation, PrivilegedCall, SECURITY_TARGET};
pub use client::{HelperClient, SpawnConfig, DEFAULT_READY_TIMEOUT};
pub use helper::{dispatch, helper_main, run_helper, PrivilegedOps};
pub use privileges::{drop_root, has_root};
pub use protocol::{read_message, write_message, Ready, Request, Response};

#[cfg(test)]
mod tests;
