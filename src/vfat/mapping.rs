use std::collections::BTreeSet;
use std::path::PathBuf;

/// File vs directory payload of a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingKind {
    /// `offset` is the position of this run within the file, in clusters.
    /// Zero until a file fragments after guest writes.
    File { offset: u32 },
    /// `first_dir_index` is where this directory's entries start in the
    /// directory array; `parent` is the mapping index of the parent
    /// directory (None for the root).
    Directory {
        parent: Option<usize>,
        first_dir_index: usize,
    },
}

/// Lifecycle state driven by the write interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingState {
    Normal,
    /// Synthetic entry with no writable host counterpart (the root run).
    Faked,
    /// Content changed; commit rewrites the host file.
    Modified,
    /// Directory entry renamed in place; carries the new short name.
    Renamed([u8; 11]),
    /// Directory entry tombstoned; commit removes the host entry.
    Deleted,
}

/// Association between a contiguous run of virtual clusters and a host
/// file or directory. Kept sorted by `begin` in the mapping table; no two
/// mappings overlap.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub begin: u32,
    pub end: u32,
    /// Index of the short-name entry in the directory array.
    pub dir_index: usize,
    /// Head of the mapping chain for a fragmented file (index of the run
    /// holding the file's first cluster).
    pub first_mapping_index: Option<usize>,
    pub kind: MappingKind,
    pub state: MappingState,
    pub path: PathBuf,
    pub read_only: bool,
    /// Data sectors (absolute) the guest has overwritten in this run.
    pub dirty_sectors: BTreeSet<u64>,
}

impl Mapping {
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, MappingKind::Directory { .. })
    }

    pub fn covers(&self, cluster: u32) -> bool {
        cluster >= self.begin && cluster < self.end
    }

    pub fn first_dir_index(&self) -> Option<usize> {
        match self.kind {
            MappingKind::Directory { first_dir_index, .. } => Some(first_dir_index),
            MappingKind::File { .. } => None,
        }
    }
}

impl Default for Mapping {
    fn default() -> Self {
        Mapping {
            begin: 0,
            end: 0,
            dir_index: 0,
            first_mapping_index: None,
            kind: MappingKind::File { offset: 0 },
            state: MappingState::Normal,
            path: PathBuf::new(),
            read_only: false,
            dirty_sectors: BTreeSet::new(),
        }
    }
}
