use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An open byte stream for one artifact.
pub(crate) struct Transfer {
    pub(crate) reader: Box<dyn Read + Send>,
    /// The stream starts at the requested offset rather than at zero.
    pub(crate) resumed: bool,
}

/// Opens `url` at `offset`. HTTP servers that ignore the `Range` header give
/// a stream from zero, reported as not resumed.
pub(crate) fn open(url: &str, offset: u64) -> Result<Transfer> {
    match local_path(url) {
        Some(path) => {
            let mut file = File::open(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            if offset > 0 {
                file.seek(SeekFrom::Start(offset))
                    .with_context(|| format!("failed to seek {}", path.display()))?;
            }
            Ok(Transfer {
                reader: Box::new(file),
                resumed: offset > 0,
            })
        }
        None => open_http(url, offset),
    }
}

/// Reads a whole (small) resource such as a summary file.
pub(crate) fn read_all(url: &str) -> Result<Vec<u8>> {
    let mut transfer = open(url, 0)?;
    let mut bytes = Vec::new();
    transfer
        .reader
        .read_to_end(&mut bytes)
        .with_context(|| format!("failed to read {url}"))?;
    Ok(bytes)
}

fn open_http(url: &str, offset: u64) -> Result<Transfer> {
    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }
    let response = request
        .send()
        .with_context(|| format!("failed to request {url}"))?;

    let status = response.status();
    if !status.is_success() {
        bail!("{url} returned HTTP {status}");
    }
    let resumed = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
    debug!(url, offset, status = status.as_u16(), resumed, "opened download");
    Ok(Transfer {
        reader: Box::new(response),
        resumed,
    })
}

fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if url.contains("://") {
        return None;
    }
    Some(PathBuf::from(url))
}
