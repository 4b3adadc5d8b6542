use anyhow::Result;

/// Whether this process runs with an effective uid of root.
#[cfg(unix)]
pub fn has_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn has_root() -> bool {
    false
}

/// Gives root away when this process was started through sudo, switching to
/// `SUDO_UID`/`SUDO_GID`. Returns whether anything changed.
#[cfg(unix)]
pub fn drop_root() -> Result<bool> {
    use anyhow::Context;
    use nix::unistd::{setgid, setuid, Gid, Uid};
    use tracing::info;

    if !has_root() {
        return Ok(false);
    }
    let (Some(uid), Some(gid)) = (sudo_id("SUDO_UID")?, sudo_id("SUDO_GID")?) else {
        return Ok(false);
    };
    if uid == 0 {
        return Ok(false);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    nix::unistd::setgroups(&[Gid::from_raw(gid)])
        .context("failed to reset supplementary groups")?;
    setgid(Gid::from_raw(gid)).with_context(|| format!("failed to switch to gid {gid}"))?;
    setuid(Uid::from_raw(uid)).with_context(|| format!("failed to switch to uid {uid}"))?;
    info!(uid, gid, "dropped root privileges");
    Ok(true)
}

#[cfg(not(unix))]
pub fn drop_root() -> Result<bool> {
    Ok(false)
}

#[cfg(unix)]
fn sudo_id(var: &str) -> Result<Option<u32>> {
    use anyhow::Context;

    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .with_context(|| format!("{var} is not a numeric id: '{raw}'")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {var}")),
    }
}
