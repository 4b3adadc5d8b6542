mod download;
mod finder;
mod graph;
mod prepare;
mod summary;
mod transport;
mod types;

pub use finder::{FetchIter, SummaryVersionFinder, VersionFinder};
pub use graph::VersionGraph;
pub use prepare::extract_archive;
pub use summary::{parse_summary, KnownFile};
pub use types::{DownloadPhase, DownloadStatus, FinderContext};
