/// Compression of one archive entry, as far as a rebuilt archive can
/// reproduce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryCompression {
    Stored,
    Deflated,
}

impl EntryCompression {
    pub(crate) fn tag(self) -> u8 {
        match self {
            Self::Stored => 0,
            Self::Deflated => 8,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Stored),
            8 => Some(Self::Deflated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    /// Entry name exactly as stored, directories keep their trailing `/`.
    pub name: String,
    pub compression: EntryCompression,
    /// Permission bits only.
    pub mode: Option<u32>,
    /// MS-DOS `(date, time)` words as stored in the entry header.
    pub modified: Option<(u16, u16)>,
}

impl ContainerEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// Entry order and per-entry metadata needed to rebuild an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLayout {
    pub entries: Vec<ContainerEntry>,
}

/// One step of a [`PatchSet`].
///
/// Paths are relative and `/`-separated. Between `EnterContainer` and the
/// matching `LeaveContainer` they address entries of that archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    Add {
        path: String,
        data: Vec<u8>,
        mode: Option<u32>,
    },
    AddDir {
        path: String,
    },
    Delete {
        path: String,
    },
    /// Duplicates a file that is unchanged in the source tree.
    Copy {
        from: String,
        to: String,
    },
    Delta {
        path: String,
        delta: Vec<u8>,
    },
    EnterContainer {
        path: String,
    },
    LeaveContainer {
        layout: ContainerLayout,
    },
}

impl PatchOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::AddDir { .. } => "add-dir",
            Self::Delete { .. } => "delete",
            Self::Copy { .. } => "copy",
            Self::Delta { .. } => "delta",
            Self::EnterContainer { .. } => "enter-container",
            Self::LeaveContainer { .. } => "leave-container",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSet {
    ops: Vec<PatchOp>,
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ops(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    pub fn push(&mut self, op: PatchOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Bytes carried by add and delta ops, a rough size for logging.
    pub fn payload_size(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                PatchOp::Add { data, .. } => data.len(),
                PatchOp::Delta { delta, .. } => delta.len(),
                _ => 0,
            })
            .sum()
    }
}

impl IntoIterator for PatchSet {
    type Item = PatchOp;
    type IntoIter = std::vec::IntoIter<PatchOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}
