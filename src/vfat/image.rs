/*
 * Virtual FAT Image
 * =================
 *
 * Presents a host directory as a FAT12/16-formatted block device. The whole
 * disk is synthesized at open time:
 *
 * 1. Layout: MBR (for >= 1 MiB images) and boot sector are rendered into
 *    `first_sectors`; the FAT and directory arrays are built in memory.
 * 2. Scan: the host tree is walked breadth-first. Every file and directory
 *    gets a run of consecutive clusters, a mapping, and 8.3 (+ long name)
 *    directory records.
 * 3. Serve: reads are resolved per sector against the synthesized regions or
 *    faulted in from host files. Writes land in the redo-log and are
 *    interpreted against the FAT/directory shadow state.
 * 4. Commit: `commit_changes` (in commit.rs) replays the interpreted
 *    mutations onto the host tree.
 *
 * The type implements std::io::{Read, Write, Seek}; the block-device glue
 * drives it with plain seek + read/write calls.
 */

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info, warn};

use crate::redolog::{Redolog, RedologSubtype, HDIMAGE_HAS_GEOMETRY};

use super::array::Table;
use super::boot_sector::{volume_label_for, BootSector, Layout};
use super::dir_entry::{
    create_long_filename, derive_short_name, lfn_checksum, long_name_units, DirEntry,
    ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_READ_ONLY, ATTR_VOLUME,
};
use super::fat::Fat;
use super::hostfs::{HostFs, LocalFs};
use super::mapping::{Mapping, MappingKind, MappingState};
use super::mbr::Mbr;
use super::{ImageError, DIR_ENTRY_SIZE, SECTOR_SIZE};

/// Where guest writes are accumulated out-of-place.
#[derive(Debug, Clone)]
pub enum RedologMode {
    /// Session-scoped log in a mkstemp-style temp file, removed on close.
    Volatile,
    /// Persistent log at the given path, reopened across sessions.
    Undoable(PathBuf),
    /// No log: data-cluster writes are only tracked, not stored.
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ImageOptions {
    pub size: u64,
    pub redolog: RedologMode,
}

impl Default for ImageOptions {
    fn default() -> Self {
        ImageOptions {
            size: 128 * 1024 * 1024,
            redolog: RedologMode::Volatile,
        }
    }
}

pub struct VfatImage {
    pub(super) layout: Layout,
    /// MBR + boot sector region, rendered once.
    first_sectors: Vec<u8>,
    pub(super) fat: Fat,
    /// Shadow FAT, cloned from `fat` on the first guest write to the FAT
    /// region and diffed against it at commit.
    pub(super) fat2: Option<Fat>,
    pub(super) directory: Table<DirEntry>,
    pub(super) mappings: Table<Mapping>,
    pub(super) host: Box<dyn HostFs>,
    pub(super) host_root: PathBuf,
    volume_label: [u8; 11],
    /// LRU of one open host file.
    current_file: Option<(PathBuf, File)>,
    pub(super) redolog: Option<Redolog>,
    pub(super) modified: bool,
    /// Slots the guest populated; resolved into host creates at commit.
    pub(super) pending_creates: Vec<(usize, PathBuf)>,
    /// Tombstoned entries that never had a mapping.
    pub(super) pending_deletes: Vec<(PathBuf, bool)>,
    /// In-place renames of entries that never had a mapping.
    pub(super) pending_renames: Vec<(PathBuf, String)>,
    pos: u64,
}

impl VfatImage {
    /// Builds the virtual disk over `host_dir` using the local filesystem.
    pub fn open(host_dir: &Path, options: ImageOptions) -> Result<Self, ImageError> {
        Self::open_with(host_dir, options, Box::new(LocalFs))
    }

    pub fn open_with(
        host_dir: &Path,
        options: ImageOptions,
        host: Box<dyn HostFs>,
    ) -> Result<Self, ImageError> {
        let layout = Layout::for_size(options.size)?;
        let host_root = host.canonicalize(host_dir).map_err(|e| {
            ImageError::HostScanFailed(format!("{}: {}", host_dir.display(), e))
        })?;
        let root_meta = host.stat(&host_root).map_err(|e| {
            ImageError::HostScanFailed(format!("{}: {}", host_root.display(), e))
        })?;
        if !root_meta.is_dir {
            return Err(ImageError::HostScanFailed(format!(
                "{} is not a directory",
                host_root.display()
            )));
        }

        let dir_name = host_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let volume_label = volume_label_for(&dir_name);

        let mut image = VfatImage {
            first_sectors: vec![0; layout.offset_to_fat as usize * SECTOR_SIZE],
            fat: Fat::new(layout.fat_type, layout.sectors_per_fat),
            fat2: None,
            directory: Table::new(),
            mappings: Table::new(),
            host,
            host_root,
            volume_label,
            current_file: None,
            redolog: None,
            modified: false,
            pending_creates: Vec::new(),
            pending_deletes: Vec::new(),
            pending_renames: Vec::new(),
            pos: 0,
            layout,
        };

        image.init_first_sectors();
        image.fat.init(image.layout.media_descriptor);
        image.init_directories()?;
        image.attach_redolog(&options.redolog)?;

        info!(
            "serving {} as {:?} ({} sectors, {} clusters of {} bytes, {} mappings)",
            image.host_root.display(),
            image.layout.fat_type,
            image.layout.sector_count,
            image.layout.cluster_count,
            image.layout.cluster_size(),
            image.mappings.len()
        );
        Ok(image)
    }

    /// Total virtual disk size in bytes.
    pub fn size(&self) -> u64 {
        self.layout.sector_count as u64 * SECTOR_SIZE as u64
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn volume_label(&self) -> &[u8; 11] {
        &self.volume_label
    }

    pub fn get_capabilities(&self) -> u32 {
        HDIMAGE_HAS_GEOMETRY
    }

    /// Tears down the session. Changes not committed are discarded; a
    /// volatile redo-log is removed from disk.
    pub fn close(mut self) -> Result<(), ImageError> {
        self.close_current_file();
        if let Some(redolog) = self.redolog.take() {
            redolog.close()?;
        }
        Ok(())
    }

    fn init_first_sectors(&mut self) {
        if self.layout.offset_to_bootsector > 0 {
            let mbr = Mbr::for_layout(&self.layout);
            self.first_sectors[..SECTOR_SIZE].copy_from_slice(&mbr.to_bytes());
        }
        let boot = BootSector::new(self.layout.clone(), self.volume_label, SystemTime::now());
        let offset = self.layout.offset_to_bootsector as usize * SECTOR_SIZE;
        self.first_sectors[offset..offset + SECTOR_SIZE].copy_from_slice(&boot.to_bytes());
    }

    fn attach_redolog(&mut self, mode: &RedologMode) -> Result<(), ImageError> {
        let size = self.size();
        match mode {
            RedologMode::Disabled => Ok(()),
            RedologMode::Volatile => {
                let hint = default_redolog_name(&self.host_root);
                self.redolog = Some(Redolog::create_volatile(&hint, size)?);
                Ok(())
            }
            RedologMode::Undoable(path) => {
                let redolog = if path.exists() {
                    Redolog::open(path, RedologSubtype::Undoable, Some(size))?
                } else {
                    Redolog::create(path, RedologSubtype::Undoable, size)?
                };
                self.redolog = Some(redolog);
                Ok(())
            }
        }
    }

    // ---- directory tree scan ------------------------------------------

    fn init_directories(&mut self) -> Result<(), ImageError> {
        let mut label_entry = DirEntry::default();
        label_entry.set_short_name(&self.volume_label);
        label_entry.attr = ATTR_VOLUME | ATTR_ARCHIVE;
        label_entry.set_times(SystemTime::now());
        self.directory.push(label_entry);

        self.mappings.push(Mapping {
            begin: 0,
            end: 0,
            dir_index: 0,
            first_mapping_index: None,
            kind: MappingKind::Directory {
                parent: None,
                first_dir_index: 0,
            },
            state: MappingState::Faked,
            path: self.host_root.clone(),
            read_only: false,
            dirty_sectors: BTreeSet::new(),
        });

        let mut next_cluster: u32 = 2;
        let mut index = 0;
        while index < self.mappings.len() {
            if self.mappings[index].is_directory() {
                self.scan_directory(index)?;
            }
            let needed = self.clusters_needed(index);
            if needed > 0 {
                let begin = next_cluster;
                let end = begin + needed;
                if end - 2 > self.layout.cluster_count {
                    return Err(ImageError::OutOfSpace);
                }
                self.fat.set_chain(begin, end);

                let mapping = &mut self.mappings[index];
                mapping.begin = begin;
                mapping.end = end;
                mapping.first_mapping_index = Some(index);
                let dir_index = mapping.dir_index;
                let dot_index = mapping.first_dir_index();
                self.directory[dir_index].set_first_cluster(begin);
                if let Some(dot) = dot_index {
                    // '.' is the first slot of every subdirectory
                    self.directory[dot].set_first_cluster(begin);
                }
                next_cluster = end;
            }
            index += 1;
        }
        Ok(())
    }

    fn clusters_needed(&self, index: usize) -> u32 {
        if index == 0 {
            return 0; // the root directory has its own fixed region
        }
        let mapping = &self.mappings[index];
        match mapping.kind {
            MappingKind::Directory { first_dir_index, .. } => {
                let span = (self.directory.len() - first_dir_index) as u32;
                let per_cluster = self.layout.entries_per_cluster() as u32;
                (span + per_cluster - 1) / per_cluster
            }
            MappingKind::File { .. } => {
                let size = self.directory[mapping.dir_index].size as u64;
                let cluster_size = self.layout.cluster_size() as u64;
                ((size + cluster_size - 1) / cluster_size) as u32
            }
        }
    }

    fn scan_directory(&mut self, mapping_index: usize) -> Result<(), ImageError> {
        let is_root = mapping_index == 0;
        let (path, parent_begin) = {
            let mapping = &self.mappings[mapping_index];
            let parent_begin = match mapping.kind {
                MappingKind::Directory { parent: Some(p), .. } => self.mappings[p].begin,
                _ => 0,
            };
            (mapping.path.clone(), parent_begin)
        };

        let entries = self.host.list_dir(&path).map_err(|e| {
            ImageError::HostScanFailed(format!("{}: {}", path.display(), e))
        })?;

        let first_dir_index = self.directory.len();
        if !is_root {
            if let MappingKind::Directory {
                first_dir_index: ref mut fdi,
                ..
            } = self.mappings[mapping_index].kind
            {
                *fdi = first_dir_index;
            }
            let now = SystemTime::now();
            let mut dot = DirEntry::default();
            dot.name.copy_from_slice(b".       ");
            dot.ext.copy_from_slice(b"   ");
            dot.attr = ATTR_DIRECTORY;
            dot.set_times(now);
            let mut dotdot = dot.clone();
            dotdot.name.copy_from_slice(b"..      ");
            // '..' of a direct child of the root points at cluster 0
            dotdot.set_first_cluster(parent_begin);
            self.directory.push(dot);
            self.directory.push(dotdot);
        }

        let mut used_names: HashSet<[u8; 11]> = HashSet::new();
        for entry in entries {
            if entry.is_symlink {
                let target = self.host.canonicalize(&path.join(&entry.name));
                match target {
                    Ok(t) if t.starts_with(&self.host_root) => {}
                    _ => {
                        debug!("skipping symlink {} leaving the tree", entry.name);
                        continue;
                    }
                }
            }
            if !entry.is_dir && entry.size > u32::MAX as u64 {
                warn!("skipping {}: too large for FAT", entry.name);
                continue;
            }

            let (short, lossy) = derive_short_name(&entry.name, &used_names);
            used_names.insert(short);
            if lossy {
                for slot in create_long_filename(&entry.name, lfn_checksum(&short)) {
                    self.directory.push(slot);
                }
            }

            let mut record = DirEntry::default();
            record.set_short_name(&short);
            record.attr = if entry.is_dir { ATTR_DIRECTORY } else { ATTR_ARCHIVE };
            if entry.read_only {
                record.attr |= ATTR_READ_ONLY;
            }
            record.set_times(entry.mtime);
            record.size = if entry.is_dir { 0 } else { entry.size as u32 };
            let dir_index = self.directory.push(record);

            if entry.is_dir || entry.size > 0 {
                self.mappings.push(Mapping {
                    begin: 0,
                    end: 0,
                    dir_index,
                    first_mapping_index: None,
                    kind: if entry.is_dir {
                        MappingKind::Directory {
                            parent: Some(mapping_index),
                            first_dir_index: 0,
                        }
                    } else {
                        MappingKind::File { offset: 0 }
                    },
                    state: MappingState::Normal,
                    path: path.join(&entry.name),
                    read_only: entry.read_only,
                    dirty_sectors: BTreeSet::new(),
                });
            }
        }

        // Pad so the region serializes to whole sectors/clusters
        if is_root {
            let root_entries = self.layout.root_entries as usize;
            if self.directory.len() > root_entries {
                return Err(ImageError::OutOfSpace);
            }
            while self.directory.len() < root_entries {
                self.directory.push(DirEntry::default());
            }
        } else {
            let span = self.directory.len() - first_dir_index;
            let per_cluster = self.layout.entries_per_cluster();
            let padded = ((span + per_cluster - 1) / per_cluster).max(1) * per_cluster;
            while self.directory.len() < first_dir_index + padded {
                self.directory.push(DirEntry::default());
            }
        }
        Ok(())
    }

    // ---- sector resolution --------------------------------------------

    pub(super) fn find_mapping_for_cluster(&self, cluster: u32) -> Option<usize> {
        let mappings = self.mappings.as_slice();
        let after = mappings.partition_point(|m| m.begin <= cluster);
        if after == 0 {
            return None;
        }
        let index = after - 1;
        if mappings[index].covers(cluster) {
            Some(index)
        } else {
            None
        }
    }

    pub(super) fn find_mapping_for_dir_index(&self, dir_index: usize) -> Option<usize> {
        (1..self.mappings.len()).find(|&i| self.mappings[i].dir_index == dir_index)
    }

    pub(super) fn close_current_file(&mut self) {
        self.current_file = None;
    }

    /// Serves one sector: the redo-log overlay wins, then the virtual disk.
    pub(super) fn read_sector(&mut self, sector: u64, out: &mut [u8]) -> io::Result<()> {
        out.fill(0);
        if let Some(redolog) = &mut self.redolog {
            if redolog.read_sector(sector * SECTOR_SIZE as u64, out)? {
                return Ok(());
            }
        }
        self.read_virtual_sector(sector, out);
        Ok(())
    }

    fn read_virtual_sector(&mut self, sector: u64, out: &mut [u8]) {
        let layout = &self.layout;
        if sector >= layout.sector_count as u64 {
            return;
        }
        if sector < layout.offset_to_fat as u64 {
            let offset = sector as usize * SECTOR_SIZE;
            out.copy_from_slice(&self.first_sectors[offset..offset + SECTOR_SIZE]);
        } else if sector < layout.offset_to_root_dir as u64 {
            // Both FAT copies serve the same bytes
            let fat_sector = (sector - layout.offset_to_fat as u64) % layout.sectors_per_fat as u64;
            let offset = fat_sector as usize * SECTOR_SIZE;
            out.copy_from_slice(&self.fat.as_bytes()[offset..offset + SECTOR_SIZE]);
        } else if sector < layout.offset_to_data as u64 {
            let first_entry =
                (sector - layout.offset_to_root_dir as u64) as usize * (SECTOR_SIZE / DIR_ENTRY_SIZE);
            self.copy_dir_entries(first_entry, out);
        } else {
            let cluster = layout.sector_to_cluster(sector);
            if cluster >= layout.cluster_count + 2 {
                return;
            }
            let Some(index) = self.find_mapping_for_cluster(cluster) else {
                return;
            };
            let mapping = &self.mappings[index];
            let intra = sector - layout.cluster_to_sector(cluster);
            match mapping.kind {
                MappingKind::Directory { first_dir_index, .. } => {
                    let cluster_offset = (cluster - mapping.begin) as u64;
                    let entry_offset = (cluster_offset * layout.sectors_per_cluster as u64 + intra)
                        as usize
                        * (SECTOR_SIZE / DIR_ENTRY_SIZE);
                    self.copy_dir_entries(first_dir_index + entry_offset, out);
                }
                MappingKind::File { offset } => {
                    let sector_in_file = (cluster - mapping.begin + offset) as u64
                        * layout.sectors_per_cluster as u64
                        + intra;
                    self.read_file_sector(index, sector_in_file, out);
                }
            }
        }
    }

    fn copy_dir_entries(&self, first_entry: usize, out: &mut [u8]) {
        for slot in 0..SECTOR_SIZE / DIR_ENTRY_SIZE {
            if let Some(entry) = self.directory.get(first_entry + slot) {
                out[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]
                    .copy_from_slice(&entry.to_bytes());
            }
        }
    }

    fn read_file_sector(&mut self, mapping_index: usize, sector_in_file: u64, out: &mut [u8]) {
        let path = self.mappings[mapping_index].path.clone();
        let cached = matches!(&self.current_file, Some((p, _)) if *p == path);
        if !cached {
            self.close_current_file();
            match self.host.open_read(&path) {
                Ok(file) => self.current_file = Some((path.clone(), file)),
                Err(err) => {
                    warn!("cannot open {}: {}", path.display(), err);
                    return;
                }
            }
        }
        let (_, file) = self.current_file.as_ref().unwrap();
        let base = sector_in_file * SECTOR_SIZE as u64;
        let mut done = 0;
        while done < out.len() {
            match file.read_at(&mut out[done..], base + done as u64) {
                Ok(0) => break, // past EOF, rest stays zero
                Ok(n) => done += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("read {} failed: {}", path.display(), err);
                    break;
                }
            }
        }
    }

    // ---- write interpretation -----------------------------------------

    fn handle_sector_write(&mut self, sector: u64, data: &[u8]) -> io::Result<()> {
        self.interpret_write(sector, data);
        if let Some(redolog) = &mut self.redolog {
            redolog.write_sector(sector * SECTOR_SIZE as u64, data)?;
        }
        Ok(())
    }

    fn interpret_write(&mut self, sector: u64, data: &[u8]) {
        let layout = self.layout.clone();
        if sector < layout.offset_to_fat as u64 {
            // Reserved region; interpretation undefined, not preserved
            warn!("dropping write to reserved sector {}", sector);
        } else if sector < layout.offset_to_root_dir as u64 {
            if self.fat2.is_none() {
                self.fat2 = Some(self.fat.clone());
            }
            let fat_sector = (sector - layout.offset_to_fat as u64) % layout.sectors_per_fat as u64;
            let offset = fat_sector as usize * SECTOR_SIZE;
            self.fat2.as_mut().unwrap().bytes_mut()[offset..offset + SECTOR_SIZE]
                .copy_from_slice(data);
            self.modified = true;
        } else if sector < layout.offset_to_data as u64 {
            let first_entry =
                (sector - layout.offset_to_root_dir as u64) as usize * (SECTOR_SIZE / DIR_ENTRY_SIZE);
            self.interpret_direntry_write(first_entry, data, self.host_root.clone());
        } else {
            let cluster = layout.sector_to_cluster(sector);
            if cluster >= layout.cluster_count + 2 {
                debug!("dropping write beyond the data region (sector {})", sector);
                return;
            }
            match self.find_mapping_for_cluster(cluster) {
                None => {
                    // Data for an entry not created yet; the redo-log keeps it
                    debug!("write to unmapped cluster {} held in redo-log", cluster);
                }
                Some(index) if self.mappings[index].is_directory() => {
                    let mapping = &self.mappings[index];
                    let first_dir_index = mapping.first_dir_index().unwrap();
                    let intra = sector - layout.cluster_to_sector(cluster);
                    let entry_offset = ((cluster - mapping.begin) as u64
                        * layout.sectors_per_cluster as u64
                        + intra) as usize
                        * (SECTOR_SIZE / DIR_ENTRY_SIZE);
                    let parent = mapping.path.clone();
                    self.interpret_direntry_write(first_dir_index + entry_offset, data, parent);
                }
                Some(index) => {
                    let mapping = &mut self.mappings[index];
                    if mapping.read_only || mapping.state == MappingState::Faked {
                        warn!(
                            "dropping write to read-only {} (cluster {})",
                            mapping.path.display(),
                            cluster
                        );
                        return;
                    }
                    if matches!(mapping.state, MappingState::Normal | MappingState::Modified) {
                        mapping.state = MappingState::Modified;
                    }
                    mapping.dirty_sectors.insert(sector);
                    self.modified = true;
                }
            }
        }
    }

    fn interpret_direntry_write(&mut self, first_entry: usize, data: &[u8], parent: PathBuf) {
        for slot in 0..SECTOR_SIZE / DIR_ENTRY_SIZE {
            let index = first_entry + slot;
            let new = DirEntry::from_bytes(&data[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]);
            while self.directory.len() <= index {
                self.directory.get_next();
            }
            let old = self.directory[index].clone();
            if new == old {
                continue;
            }
            self.directory[index] = new.clone();
            self.modified = true;

            if new.is_long_name() && !new.is_deleted() {
                continue; // classified with their short entry
            }
            if new.is_volume_label() {
                continue;
            }

            let old_occupied = old.is_occupied();
            if !old_occupied && new.is_occupied() {
                if !self.pending_creates.iter().any(|(i, _)| *i == index) {
                    info!(
                        "guest created {} in {}",
                        new.host_name(),
                        parent.display()
                    );
                    self.pending_creates.push((index, parent.clone()));
                }
            } else if old_occupied && new.is_deleted() {
                self.pending_creates.retain(|(i, _)| *i != index);
                match self.find_mapping_for_dir_index(index) {
                    Some(mapping_index) => {
                        info!("guest deleted {}", self.mappings[mapping_index].path.display());
                        self.mappings[mapping_index].state = MappingState::Deleted;
                    }
                    None => {
                        let name = self
                            .reconstruct_long_name(index, &old.short_name())
                            .unwrap_or_else(|| old.host_name());
                        self.pending_deletes
                            .push((parent.join(name), old.is_directory()));
                    }
                }
                self.modified = true;
            } else if old_occupied && new.is_occupied() {
                if new.short_name() != old.short_name()
                    && new.first_cluster() == old.first_cluster()
                {
                    match self.find_mapping_for_dir_index(index) {
                        Some(mapping_index) => {
                            info!(
                                "guest renamed {} to {}",
                                self.mappings[mapping_index].path.display(),
                                new.host_name()
                            );
                            self.mappings[mapping_index].state =
                                MappingState::Renamed(new.short_name());
                        }
                        None => {
                            let old_name = self
                                .reconstruct_long_name(index, &old.short_name())
                                .unwrap_or_else(|| old.host_name());
                            self.pending_renames
                                .push((parent.join(old_name), new.host_name()));
                        }
                    }
                } else if new.first_cluster() != old.first_cluster() || new.size != old.size {
                    match self.find_mapping_for_dir_index(index) {
                        Some(mapping_index) => {
                            let mapping = &mut self.mappings[mapping_index];
                            if !mapping.read_only
                                && matches!(
                                    mapping.state,
                                    MappingState::Normal | MappingState::Modified
                                )
                            {
                                mapping.state = MappingState::Modified;
                            }
                        }
                        None => {
                            // No mapping (e.g. a file that was empty at scan
                            // time); rebuild it from its chain at commit
                            if !self.pending_creates.iter().any(|(i, _)| *i == index) {
                                self.pending_creates.push((index, parent.clone()));
                            }
                        }
                    }
                }
                // Attribute-only changes (archive bit and friends) are not
                // propagated to the host
            }
        }
    }

    /// Rebuilds a long filename from the slots preceding `dir_index`.
    /// Works on tombstoned chains too: only the ordinal byte is lost then.
    pub(super) fn reconstruct_long_name(
        &self,
        dir_index: usize,
        short: &[u8; 11],
    ) -> Option<String> {
        let checksum = lfn_checksum(short);
        let mut units: Vec<u16> = Vec::new();
        let mut index = dir_index;
        while index > 0 {
            index -= 1;
            let entry = self.directory.get(index)?;
            if entry.attr & 0x3F != super::dir_entry::ATTR_LONG_NAME {
                break;
            }
            let raw = entry.to_bytes();
            if raw[13] != checksum {
                break;
            }
            units.extend(long_name_units(entry));
        }
        if units.is_empty() {
            return None;
        }
        let end = units.iter().position(|&u| u == 0x0000).unwrap_or(units.len());
        units.truncate(end);
        while units.last() == Some(&0xFFFF) {
            units.pop();
        }
        let name: String = char::decode_utf16(units.into_iter())
            .map(|c| c.unwrap_or('_'))
            .collect();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

fn default_redolog_name(host_root: &Path) -> PathBuf {
    let mut name = host_root.as_os_str().to_owned();
    name.push(".redolog");
    PathBuf::from(name)
}

impl Seek for VfatImage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.size() as i64 + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of image",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

impl Read for VfatImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.size();
        if self.pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((size - self.pos) as usize);
        debug!("R - {}, {}", self.pos, want);

        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < want {
            let position = self.pos + done as u64;
            let sector = position / SECTOR_SIZE as u64;
            let intra = (position % SECTOR_SIZE as u64) as usize;
            self.read_sector(sector, &mut sector_buf)?;
            let chunk = (SECTOR_SIZE - intra).min(want - done);
            buf[done..done + chunk].copy_from_slice(&sector_buf[intra..intra + chunk]);
            done += chunk;
        }
        self.pos += done as u64;
        Ok(done)
    }
}

impl Write for VfatImage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size = self.size();
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past end of image",
            ));
        }
        let want = buf.len().min((size - self.pos) as usize);
        debug!("W - {}, {}", self.pos, want);

        let mut done = 0;
        while done < want {
            let position = self.pos + done as u64;
            let sector = position / SECTOR_SIZE as u64;
            let intra = (position % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - intra).min(want - done);
            if intra == 0 && chunk == SECTOR_SIZE {
                let data: [u8; SECTOR_SIZE] =
                    buf[done..done + SECTOR_SIZE].try_into().unwrap();
                self.handle_sector_write(sector, &data)?;
            } else {
                // Sub-sector write: merge into the current sector image
                let mut sector_buf = [0u8; SECTOR_SIZE];
                self.read_sector(sector, &mut sector_buf)?;
                sector_buf[intra..intra + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.handle_sector_write(sector, &sector_buf)?;
            }
            done += chunk;
        }
        self.pos += done as u64;
        Ok(done)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Committing to the host tree is explicit via commit_changes()
        Ok(())
    }
}
