use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use anyhow::Result;
use esky_core::{EskyError, VersionNumber};

use crate::summary::KnownFile;

/// Upgrade graph over the summary entries for one app and platform.
///
/// Versions are nodes; each known file is an edge from every version its
/// `from_versions` matches to the version it produces. Downgrades are not
/// edges.
#[derive(Debug, Clone, Default)]
pub struct VersionGraph {
    files: Vec<KnownFile>,
}

impl VersionGraph {
    pub fn new(files: impl IntoIterator<Item = KnownFile>) -> Self {
        Self {
            files: files.into_iter().collect(),
        }
    }

    pub fn files(&self) -> &[KnownFile] {
        &self.files
    }

    /// Drops a file that failed to download or apply, so planning routes
    /// around it.
    pub fn remove_file(&mut self, dead: &KnownFile) -> bool {
        let before = self.files.len();
        self.files.retain(|file| file != dead);
        self.files.len() != before
    }

    fn edges_from(&self, version: &VersionNumber) -> Vec<&KnownFile> {
        self.files
            .iter()
            .filter(|file| {
                file.upgrades_from(version) && file.version.cmp_lenient(version) != Ordering::Less
            })
            .collect()
    }

    /// Every version reachable from `source`, excluding `source` itself.
    pub fn reachable_from(&self, source: &VersionNumber) -> Vec<&KnownFile> {
        let mut seen = HashSet::from([source.clone()]);
        let mut pending = vec![source.clone()];
        let mut reached = Vec::new();

        while let Some(version) = pending.pop() {
            for file in self.edges_from(&version) {
                if seen.insert(file.version.clone()) {
                    pending.push(file.version.clone());
                    reached.push(file);
                }
            }
        }
        reached
    }

    /// Cheapest chain of files turning `source` into `target` (Dijkstra,
    /// stopping once the target is settled). Versions newer than the target
    /// are never stepped through.
    pub fn best_path(
        &self,
        source: &VersionNumber,
        target: &VersionNumber,
        cost: impl Fn(&KnownFile) -> u64,
    ) -> Result<Vec<KnownFile>> {
        struct Visit<'a> {
            cost: u64,
            previous: Option<(usize, &'a KnownFile)>,
            settled: bool,
        }

        let mut nodes = vec![source.clone()];
        let mut index = HashMap::from([(source.clone(), 0_usize)]);
        let mut visits = vec![Visit {
            cost: 0,
            previous: None,
            settled: false,
        }];
        let mut queue = BinaryHeap::from([Reverse((0_u64, 0_usize))]);

        while let Some(Reverse((cost_so_far, node))) = queue.pop() {
            if visits[node].settled || cost_so_far > visits[node].cost {
                continue;
            }
            visits[node].settled = true;
            if nodes[node] == *target {
                break;
            }

            let version = nodes[node].clone();
            for file in self.edges_from(&version) {
                if file.version.cmp_lenient(target) == Ordering::Greater {
                    continue;
                }
                let next_cost = cost_so_far.saturating_add(cost(file));
                let next = match index.get(&file.version) {
                    Some(next) => *next,
                    None => {
                        nodes.push(file.version.clone());
                        visits.push(Visit {
                            cost: u64::MAX,
                            previous: None,
                            settled: false,
                        });
                        index.insert(file.version.clone(), nodes.len() - 1);
                        nodes.len() - 1
                    }
                };
                if !visits[next].settled && next_cost < visits[next].cost {
                    visits[next].cost = next_cost;
                    visits[next].previous = Some((node, file));
                    queue.push(Reverse((next_cost, next)));
                }
            }
        }

        let no_path = || EskyError::NoUpdatePath {
            from: display_version(source),
            to: target.to_string(),
        };
        let Some(mut node) = index.get(target).copied() else {
            return Err(no_path().into());
        };
        if !visits[node].settled {
            return Err(no_path().into());
        }

        let mut path = Vec::new();
        while let Some((previous, file)) = visits[node].previous {
            path.push(file.clone());
            node = previous;
        }
        path.reverse();
        Ok(path)
    }
}

pub(crate) fn display_version(version: &VersionNumber) -> String {
    if version.is_blank() {
        "nothing installed".to_string()
    } else {
        version.to_string()
    }
}
