use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use esky_core::{EskyError, VersionName};
use esky_fstxn::{recover_stale_transactions, remove_path, TxnStrategy};
use esky_installer::list_prepared_versions;
use esky_security::SignatureVerifier;
use tracing::{debug, info, warn};

use crate::download::{Download, DownloadStep};
use crate::graph::{display_version, VersionGraph};
use crate::prepare::prepare_version;
use crate::summary::{parse_summary, resolve_url, KnownFile};
use crate::transport;
use crate::types::{DownloadPhase, DownloadStatus, FinderContext};

/// Progress of a fetch, pulled one step at a time.
pub type FetchIter<'a> = Box<dyn Iterator<Item = Result<DownloadStatus>> + 'a>;

/// Discovers and retrieves new versions of an application.
pub trait VersionFinder {
    /// Versions newer than `ctx.current` that can be reached, newest first.
    fn find_versions(&mut self, ctx: &FinderContext) -> Result<Vec<VersionName>>;

    /// Lazily downloads and prepares `version`. Dropping the iterator early
    /// abandons the fetch; partial downloads are resumed or discarded later.
    fn fetch_version_iter<'a>(
        &'a mut self,
        ctx: &'a FinderContext,
        version: &VersionName,
    ) -> FetchIter<'a>;

    /// Drives [`VersionFinder::fetch_version_iter`] to completion and returns
    /// the prepared tree.
    fn fetch_version(
        &mut self,
        ctx: &FinderContext,
        version: &VersionName,
        callback: &mut dyn FnMut(&DownloadStatus),
    ) -> Result<PathBuf> {
        for status in self.fetch_version_iter(ctx, version) {
            callback(&status?);
        }
        self.has_version(ctx, version)?
            .ok_or_else(|| anyhow!("fetch of {version} finished without a prepared tree"))
    }

    /// The prepared tree of `version`, if one is waiting to be installed.
    fn has_version(&self, ctx: &FinderContext, version: &VersionName) -> Result<Option<PathBuf>>;

    fn needs_cleanup(&self, ctx: &FinderContext) -> Result<bool>;

    fn cleanup(&mut self, ctx: &FinderContext) -> Result<()>;
}

/// Finder driven by a summary file listing every downloadable artifact.
pub struct SummaryVersionFinder {
    summary_url: String,
    verifier: Option<Box<dyn SignatureVerifier>>,
    strategy: TxnStrategy,
    known_files: Vec<KnownFile>,
    graph: Option<VersionGraph>,
}

impl SummaryVersionFinder {
    pub fn new(summary_url: impl Into<String>) -> Self {
        Self {
            summary_url: summary_url.into(),
            verifier: None,
            strategy: TxnStrategy::Auto,
            known_files: Vec::new(),
            graph: None,
        }
    }

    /// Requires `<summary_url>.sig` to verify against the summary bytes.
    pub fn with_verifier(mut self, verifier: Box<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_strategy(mut self, strategy: TxnStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn summary_url(&self) -> &str {
        &self.summary_url
    }

    pub fn known_files(&self) -> &[KnownFile] {
        &self.known_files
    }

    /// Downloads and parses the summary file again.
    pub fn update_summary(&mut self) -> Result<()> {
        let bytes = transport::read_all(&self.summary_url)
            .with_context(|| format!("failed to fetch summary {}", self.summary_url))?;
        if let Some(verifier) = &self.verifier {
            let signature_url = format!("{}.sig", self.summary_url);
            let signature = transport::read_all(&signature_url)
                .with_context(|| format!("failed to fetch summary signature {signature_url}"))?;
            if !verifier.verify(&bytes, &signature)? {
                return Err(EskyError::CorruptArtifact {
                    path: PathBuf::from(&self.summary_url),
                    detail: "summary signature does not verify".to_string(),
                }
                .into());
            }
        }

        let text = String::from_utf8(bytes).context("summary file is not UTF-8")?;
        self.known_files = parse_summary(&text)
            .into_iter()
            .map(|mut file| {
                file.url = resolve_url(&self.summary_url, &file.url);
                file
            })
            .collect();
        debug!(url = %self.summary_url, files = self.known_files.len(), "loaded summary");
        Ok(())
    }

    fn build_graph(&self, ctx: &FinderContext) -> VersionGraph {
        VersionGraph::new(
            self.known_files
                .iter()
                .filter(|file| file.is_for(&ctx.app_name, &ctx.platform))
                .cloned(),
        )
    }

    fn graph_for(&mut self, ctx: &FinderContext) -> Result<&mut VersionGraph> {
        if self.graph.is_none() {
            self.update_summary()?;
            self.graph = Some(self.build_graph(ctx));
        }
        self.graph
            .as_mut()
            .ok_or_else(|| anyhow!("upgrade graph is not loaded"))
    }

    fn plan(&mut self, ctx: &FinderContext, target: &VersionName) -> Result<Vec<KnownFile>> {
        let source = ctx.source_version();
        if source == target.version {
            return Err(anyhow!("{target} is already the current version"));
        }
        let graph = self.graph_for(ctx)?;
        let path = graph.best_path(&source, &target.version, |file| {
            let verified = file
                .download_path(&ctx.layout)
                .and_then(|path| file.is_verified(&path))
                .unwrap_or(false);
            file.cost(verified)
        })?;
        debug!(
            from = %display_version(&source),
            to = %target,
            steps = path.len(),
            "planned update path"
        );
        Ok(path)
    }

    /// Drops `file` from the graph and checks whether another path is left.
    /// When none is, `err` is returned as-is.
    fn route_around(
        &mut self,
        ctx: &FinderContext,
        target: &VersionName,
        file: &KnownFile,
        err: anyhow::Error,
    ) -> Result<()> {
        warn!(url = %file.url, error = %format!("{err:#}"), "artifact failed, trying another path");
        if let Some(graph) = self.graph.as_mut() {
            graph.remove_file(file);
        }
        match self.plan(ctx, target) {
            Ok(_) => Ok(()),
            Err(_) => Err(err),
        }
    }

    /// Download files that the current summary does not know or that do
    /// not verify.
    fn stale_downloads(&self, ctx: &FinderContext) -> Result<Vec<PathBuf>> {
        let dir = ctx.layout.downloads_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
        };

        let mut stale = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let mut known = self
                .known_files
                .iter()
                .filter(|file| file.file_name().is_ok_and(|known| known == name))
                .peekable();
            if known.peek().is_none() {
                stale.push(path);
                continue;
            }
            let mut verified = false;
            for file in known {
                if file.is_verified(&path)? {
                    verified = true;
                    break;
                }
            }
            if !verified {
                stale.push(path);
            }
        }
        Ok(stale)
    }
}

impl VersionFinder for SummaryVersionFinder {
    fn find_versions(&mut self, ctx: &FinderContext) -> Result<Vec<VersionName>> {
        self.update_summary()?;
        let graph = self.build_graph(ctx);
        let source = ctx.source_version();

        let mut versions = Vec::new();
        for file in graph.reachable_from(&source) {
            match ctx.version_name(&file.version_str) {
                Ok(name) => versions.push(name),
                Err(err) => {
                    warn!(version = %file.version_str, error = %format!("{err:#}"), "skipping unusable version");
                }
            }
        }
        versions.sort_by(|left, right| right.version.cmp_lenient(&left.version));
        self.graph = Some(graph);
        Ok(versions)
    }

    fn fetch_version_iter<'a>(
        &'a mut self,
        ctx: &'a FinderContext,
        version: &VersionName,
    ) -> FetchIter<'a> {
        Box::new(SummaryFetch {
            finder: self,
            ctx,
            target: version.clone(),
            state: FetchState::Plan,
        })
    }

    fn has_version(&self, ctx: &FinderContext, version: &VersionName) -> Result<Option<PathBuf>> {
        Ok(list_prepared_versions(&ctx.layout, &ctx.app_name)?
            .into_iter()
            .find(|prepared| {
                prepared.name.same_app(&version.app_name, &version.platform)
                    && prepared.name.version == version.version
            })
            .map(|prepared| prepared.path))
    }

    fn needs_cleanup(&self, ctx: &FinderContext) -> Result<bool> {
        if !self.stale_downloads(ctx)?.is_empty() {
            return Ok(true);
        }
        for dir in [ctx.layout.unpack_dir(), ctx.layout.ready_dir()] {
            match fs::read_dir(&dir) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        return Ok(true);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read {}", dir.display()))
                }
            }
        }
        Ok(false)
    }

    /// Refreshes the summary, then removes unknown or broken downloads and
    /// empties the unpack and ready directories. Nothing is touched when the
    /// summary cannot be fetched.
    fn cleanup(&mut self, ctx: &FinderContext) -> Result<()> {
        if let Err(err) = self.update_summary() {
            warn!(error = %format!("{err:#}"), "summary unavailable, skipping finder cleanup");
            return Ok(());
        }

        let updates = ctx.layout.updates_dir();
        if updates.is_dir() {
            recover_stale_transactions(&updates)?;
        }
        for stale in self.stale_downloads(ctx)? {
            debug!(path = %stale.display(), "removing stale download");
            remove_path(&stale).with_context(|| format!("failed to remove {}", stale.display()))?;
        }
        for dir in [ctx.layout.unpack_dir(), ctx.layout.ready_dir()] {
            remove_path(&dir).with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        ctx.layout.ensure_update_dirs()?;
        info!(app = %ctx.app_name, "cleaned up update directories");
        Ok(())
    }
}

enum FetchState {
    Plan,
    Download {
        path: Vec<KnownFile>,
        index: usize,
        current: Option<Download>,
    },
    Prepare {
        path: Vec<KnownFile>,
    },
    Done,
}

/// State machine behind [`SummaryVersionFinder`]'s fetch iterator.
///
/// A file that fails to download, verify or apply is dropped from the
/// graph and the fetch starts over on the next cheapest path.
struct SummaryFetch<'a> {
    finder: &'a mut SummaryVersionFinder,
    ctx: &'a FinderContext,
    target: VersionName,
    state: FetchState,
}

impl SummaryFetch<'_> {
    fn advance(&mut self) -> Result<Option<DownloadStatus>> {
        loop {
            match std::mem::replace(&mut self.state, FetchState::Done) {
                FetchState::Done => return Ok(None),
                FetchState::Plan => {
                    let path = self.finder.plan(self.ctx, &self.target)?;
                    self.state = FetchState::Download {
                        path,
                        index: 0,
                        current: None,
                    };
                }
                FetchState::Download {
                    path,
                    index,
                    current,
                } => {
                    let Some(file) = path.get(index).cloned() else {
                        self.state = FetchState::Prepare { path };
                        return Ok(Some(DownloadStatus {
                            fetched: 0,
                            total: None,
                            file: self.target.dir_name(),
                            phase: DownloadPhase::Preparing,
                        }));
                    };
                    match self.download_step(&file, current) {
                        Ok((Some(download), status)) => {
                            self.state = FetchState::Download {
                                path,
                                index,
                                current: Some(download),
                            };
                            return Ok(Some(status));
                        }
                        Ok((None, status)) => {
                            self.state = FetchState::Download {
                                path,
                                index: index + 1,
                                current: None,
                            };
                            return Ok(Some(status));
                        }
                        Err(err) => {
                            self.finder.route_around(self.ctx, &self.target, &file, err)?;
                            self.state = FetchState::Plan;
                        }
                    }
                }
                FetchState::Prepare { path } => {
                    match prepare_version(self.ctx, &self.target, &path, self.finder.strategy) {
                        Ok(ready) => {
                            return Ok(Some(DownloadStatus {
                                fetched: 0,
                                total: None,
                                file: ready.display().to_string(),
                                phase: DownloadPhase::Ready,
                            }));
                        }
                        Err(failure) => match failure.file {
                            Some(file) => {
                                self.finder
                                    .route_around(self.ctx, &self.target, &file, failure.error)?;
                                self.state = FetchState::Plan;
                            }
                            None => return Err(failure.error),
                        },
                    }
                }
            }
        }
    }

    /// Moves the download of `file` one chunk forward. Returns the download
    /// to continue with, or `None` once the file is verified.
    fn download_step(
        &self,
        file: &KnownFile,
        current: Option<Download>,
    ) -> Result<(Option<Download>, DownloadStatus)> {
        let dest = file.download_path(&self.ctx.layout)?;
        let file_name = file.file_name()?;
        let mut download = match current {
            Some(download) => download,
            None => {
                if file.is_verified(&dest)? {
                    return Ok((None, verified_status(file, &file_name, &dest)?));
                }
                discard_unresumable(file, &dest)?;
                Download::new(file, dest.clone())
            }
        };

        match download.step()? {
            DownloadStep::Progress { fetched } => Ok((
                Some(download),
                DownloadStatus {
                    fetched,
                    total: file.size,
                    file: file_name,
                    phase: DownloadPhase::Downloading,
                },
            )),
            DownloadStep::Complete => {
                if !file.is_verified(download.dest())? {
                    remove_path(download.dest()).with_context(|| {
                        format!("failed to remove {}", download.dest().display())
                    })?;
                    return Err(EskyError::CorruptArtifact {
                        path: dest,
                        detail: format!("{} does not match its summary entry", file.url),
                    }
                    .into());
                }
                Ok((None, verified_status(file, &file_name, &dest)?))
            }
        }
    }
}

impl Iterator for SummaryFetch<'_> {
    type Item = Result<DownloadStatus>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.state, FetchState::Done) {
            return None;
        }
        match self.advance() {
            Ok(Some(status)) => {
                if status.phase == DownloadPhase::Ready {
                    self.state = FetchState::Done;
                }
                Some(Ok(status))
            }
            Ok(None) => None,
            Err(err) => {
                self.state = FetchState::Done;
                Some(Err(err))
            }
        }
    }
}

/// A local file at or past the expected size that does not verify cannot be
/// resumed, so it is removed before downloading again.
fn discard_unresumable(file: &KnownFile, dest: &Path) -> Result<()> {
    let Some(size) = file.size else {
        return Ok(());
    };
    match fs::metadata(dest) {
        Ok(metadata) if metadata.len() >= size => {
            debug!(path = %dest.display(), "discarding unverifiable download");
            remove_path(dest).with_context(|| format!("failed to remove {}", dest.display()))
        }
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to stat {}", dest.display())),
    }
}

fn verified_status(file: &KnownFile, file_name: &str, dest: &Path) -> Result<DownloadStatus> {
    let fetched = fs::metadata(dest)
        .with_context(|| format!("failed to stat {}", dest.display()))?
        .len();
    Ok(DownloadStatus {
        fetched,
        total: file.size.or(Some(fetched)),
        file: file_name.to_string(),
        phase: DownloadPhase::Verified,
    })
}
