use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use esky_fstxn::remove_path;
use tracing::{debug, warn};

use crate::summary::KnownFile;
use crate::transport;

const CHUNK_SIZE: usize = 64 * 1024;
const ATTEMPTS: u32 = 2;

pub(crate) enum DownloadStep {
    Progress { fetched: u64 },
    /// Every byte the summary promises is on disk. Verification is up to
    /// the caller.
    Complete,
}

/// Resumable download of one known file into `updates/downloads/`.
///
/// Each [`Download::step`] moves at most one chunk, so callers can report
/// progress or stop pulling at any point; a partial file stays behind for
/// the next attempt to resume or discard.
pub(crate) struct Download {
    url: String,
    dest: PathBuf,
    size: Option<u64>,
    attempts_left: u32,
    resumed_from: Option<u64>,
    active: Option<(Box<dyn Read + Send>, File)>,
}

impl Download {
    pub(crate) fn new(file: &KnownFile, dest: PathBuf) -> Self {
        Self {
            url: file.url.clone(),
            dest,
            size: file.size,
            attempts_left: ATTEMPTS,
            resumed_from: None,
            active: None,
        }
    }

    pub(crate) fn dest(&self) -> &Path {
        &self.dest
    }

    pub(crate) fn step(&mut self) -> Result<DownloadStep> {
        loop {
            if let Some((reader, out)) = &mut self.active {
                let mut buffer = vec![0_u8; CHUNK_SIZE];
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        self.active = None;
                    }
                    Ok(read) => {
                        out.write_all(&buffer[..read])
                            .with_context(|| format!("failed to write {}", self.dest.display()))?;
                        return Ok(DownloadStep::Progress {
                            fetched: local_len(&self.dest)?.unwrap_or_default(),
                        });
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        self.active = None;
                        self.fail(anyhow!(err).context(format!("failed to read {}", self.url)))?;
                    }
                }
                continue;
            }

            let seek_to = match (local_len(&self.dest)?, self.size) {
                (Some(actual), None) if actual > 0 => return Ok(DownloadStep::Complete),
                (Some(actual), Some(size)) if actual >= size => return Ok(DownloadStep::Complete),
                (Some(actual), Some(_)) => actual,
                _ => 0,
            };

            if self.resumed_from == Some(seek_to) {
                // The last transfer ended without adding a byte.
                self.resumed_from = None;
                remove_path(&self.dest)
                    .with_context(|| format!("failed to remove {}", self.dest.display()))?;
                self.fail(anyhow!("download of {} stalled at byte {seek_to}", self.url))?;
                continue;
            }

            if let Err(err) = self.open(seek_to) {
                self.fail(err)?;
            }
        }
    }

    fn open(&mut self, seek_to: u64) -> Result<()> {
        if let Some(parent) = self.dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let transfer = transport::open(&self.url, seek_to)?;
        let out = if transfer.resumed {
            OpenOptions::new().append(true).open(&self.dest)
        } else {
            File::create(&self.dest)
        }
        .with_context(|| format!("failed to open {}", self.dest.display()))?;

        let offset = if transfer.resumed { seek_to } else { 0 };
        debug!(url = %self.url, offset, "downloading");
        self.resumed_from = Some(offset);
        self.active = Some((transfer.reader, out));
        Ok(())
    }

    fn fail(&mut self, err: anyhow::Error) -> Result<()> {
        self.attempts_left = self.attempts_left.saturating_sub(1);
        warn!(
            url = %self.url,
            attempts_left = self.attempts_left,
            error = %format!("{err:#}"),
            "download attempt failed"
        );
        if self.attempts_left == 0 {
            return Err(err.context(format!(
                "failed to download {} after {ATTEMPTS} attempts",
                self.url
            )));
        }
        Ok(())
    }
}

fn local_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to stat {}", path.display())),
    }
}
