/*
 * Commit Engine
 * =============
 *
 * Reconciles the interpreted guest writes with the host tree, in a fixed
 * order: deletes, renames, rewrites of modified files, then creation of new
 * entries (directories before the files found inside their clusters).
 * Cluster content is read back through the regular sector path, so the
 * redo-log overlay supplies the bytes the guest wrote and the live host
 * files supply the rest.
 *
 * A failure on one entry is recorded and skipped; everything else still
 * applies, and the entry stays marked so a later flush retries it.
 */

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use log::{error, info};

use super::dir_entry::{long_name_units, DirEntry};
use super::fat::Fat;
use super::image::VfatImage;
use super::mapping::{Mapping, MappingKind, MappingState};
use super::{ImageError, DIR_ENTRY_SIZE, SECTOR_SIZE};

impl VfatImage {
    /// Flushes all interpreted guest changes back to the host filesystem.
    pub fn commit_changes(&mut self) -> Result<(), ImageError> {
        let has_marks = self
            .mappings
            .iter()
            .any(|m| !matches!(m.state, MappingState::Normal | MappingState::Faked));
        if !self.modified
            && !has_marks
            && self.pending_creates.is_empty()
            && self.pending_deletes.is_empty()
            && self.pending_renames.is_empty()
        {
            return Ok(());
        }

        info!("committing changes to {}", self.host_root.display());
        self.close_current_file();
        let mut errors: Vec<String> = Vec::new();

        self.mark_relocated_chains();

        // 1. deletes
        let mut removed: BTreeSet<usize> = BTreeSet::new();
        for index in 0..self.mappings.len() {
            if self.mappings[index].state != MappingState::Deleted {
                continue;
            }
            let path = self.mappings[index].path.clone();
            let result = if self.mappings[index].is_directory() {
                self.host.remove_dir(&path)
            } else {
                self.host.remove_file(&path)
            };
            match result {
                Ok(()) => {
                    info!("removed {}", path.display());
                    removed.insert(index);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    removed.insert(index);
                }
                Err(err) => errors.push(format!("remove {}: {}", path.display(), err)),
            }
        }
        let deletes = std::mem::take(&mut self.pending_deletes);
        for (path, is_dir) in deletes {
            let result = if is_dir {
                self.host.remove_dir(&path)
            } else {
                self.host.remove_file(&path)
            };
            match result {
                Ok(()) => info!("removed {}", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    errors.push(format!("remove {}: {}", path.display(), err));
                    self.pending_deletes.push((path, is_dir));
                }
            }
        }

        // 2. renames
        for index in 0..self.mappings.len() {
            let short = match &self.mappings[index].state {
                MappingState::Renamed(short) => *short,
                _ => continue,
            };
            let old_path = self.mappings[index].path.clone();
            let new_path = sibling_path(&old_path, &super::dir_entry::short_to_host_name(&short));
            match self.host.rename(&old_path, &new_path) {
                Ok(()) => {
                    info!("renamed {} to {}", old_path.display(), new_path.display());
                    let mapping = &mut self.mappings[index];
                    mapping.path = new_path;
                    mapping.state = if mapping.dirty_sectors.is_empty() {
                        MappingState::Normal
                    } else {
                        MappingState::Modified
                    };
                }
                Err(err) => errors.push(format!(
                    "rename {} -> {}: {}",
                    old_path.display(),
                    new_path.display(),
                    err
                )),
            }
        }
        let renames = std::mem::take(&mut self.pending_renames);
        for (old_path, new_name) in renames {
            let new_path = sibling_path(&old_path, &new_name);
            match self.host.rename(&old_path, &new_path) {
                Ok(()) => info!("renamed {} to {}", old_path.display(), new_path.display()),
                Err(err) => {
                    errors.push(format!("rename {}: {}", old_path.display(), err));
                    self.pending_renames.push((old_path, new_name));
                }
            }
        }

        // 3. modified files
        for index in 0..self.mappings.len() {
            if self.mappings[index].state != MappingState::Modified
                || self.mappings[index].is_directory()
            {
                continue;
            }
            match self.rewrite_mapped_file(index) {
                Ok(()) => {
                    let mapping = &mut self.mappings[index];
                    mapping.state = MappingState::Normal;
                    mapping.dirty_sectors.clear();
                }
                Err(message) => errors.push(message),
            }
        }

        // 4. new entries
        let creates = std::mem::take(&mut self.pending_creates);
        for (index, parent) in creates {
            let entry = self.directory[index].clone();
            if !entry.is_occupied() {
                continue; // tombstoned again before this flush
            }
            let name = self
                .reconstruct_long_name(index, &entry.short_name())
                .unwrap_or_else(|| entry.host_name());
            let path = parent.join(&name);
            let before = errors.len();
            if entry.is_directory() {
                self.create_tree(&entry, &path, &mut errors, 0);
            } else if let Err(message) = self.write_new_file(&entry, &path) {
                errors.push(message);
            }
            if errors.len() > before {
                self.pending_creates.push((index, parent));
            }
        }

        // 5. adopt the shadow FAT and reset bookkeeping
        if let Some(fat2) = self.fat2.take() {
            self.fat = fat2;
        }
        self.prune_mappings(&removed);
        self.close_current_file();
        self.modified = !errors.is_empty();

        if errors.is_empty() {
            Ok(())
        } else {
            for message in &errors {
                error!("commit: {}", message);
            }
            Err(ImageError::Commit(errors))
        }
    }

    /// FAT writes may have moved a file's chain without touching its data
    /// sectors or directory entry size; catch those by diffing each chain
    /// against the mapping's original run.
    fn mark_relocated_chains(&mut self) {
        if self.fat2.is_none() {
            return;
        }
        let cluster_count = self.layout.cluster_count;
        for index in 1..self.mappings.len() {
            let moved = {
                let mapping = &self.mappings[index];
                if mapping.is_directory()
                    || mapping.read_only
                    || mapping.state != MappingState::Normal
                {
                    continue;
                }
                let first = self.directory[mapping.dir_index].first_cluster();
                if first != mapping.begin {
                    true
                } else {
                    let chain = self.fat2.as_ref().unwrap().chain(first, cluster_count);
                    chain.len() as u32 != mapping.end - mapping.begin
                        || chain
                            .iter()
                            .zip(mapping.begin..mapping.end)
                            .any(|(&got, want)| got != want)
                }
            };
            if moved {
                self.mappings[index].state = MappingState::Modified;
                self.modified = true;
            }
        }
    }

    fn commit_fat(&self) -> &Fat {
        self.fat2.as_ref().unwrap_or(&self.fat)
    }

    /// Concatenates a cluster chain through the sector path (redo-log first,
    /// live data second), clipped to `size` bytes.
    pub(super) fn read_chain_content(
        &mut self,
        first_cluster: u32,
        size: u32,
    ) -> io::Result<Vec<u8>> {
        if size == 0 || first_cluster < 2 {
            return Ok(Vec::new());
        }
        let chain = self.commit_fat().chain(first_cluster, self.layout.cluster_count);
        let sectors_per_cluster = self.layout.sectors_per_cluster as u64;

        let mut content = Vec::with_capacity(size as usize);
        let mut sector_buf = [0u8; SECTOR_SIZE];
        'chain: for &cluster in &chain {
            let base = self.layout.cluster_to_sector(cluster);
            for offset in 0..sectors_per_cluster {
                self.read_sector(base + offset, &mut sector_buf)?;
                content.extend_from_slice(&sector_buf);
                if content.len() >= size as usize {
                    break 'chain;
                }
            }
        }
        content.truncate(size as usize);
        Ok(content)
    }

    fn rewrite_mapped_file(&mut self, index: usize) -> Result<(), String> {
        let (path, dir_index) = {
            let mapping = &self.mappings[index];
            (mapping.path.clone(), mapping.dir_index)
        };
        let entry = self.directory[dir_index].clone();
        let content = self
            .read_chain_content(entry.first_cluster(), entry.size)
            .map_err(|err| format!("read back {}: {}", path.display(), err))?;
        self.host
            .replace_file(&path, &content)
            .map_err(|err| format!("rewrite {}: {}", path.display(), err))?;
        info!("rewrote {} ({} bytes)", path.display(), content.len());
        Ok(())
    }

    fn write_new_file(&mut self, entry: &DirEntry, path: &Path) -> Result<(), String> {
        let content = self
            .read_chain_content(entry.first_cluster(), entry.size)
            .map_err(|err| format!("read back {}: {}", path.display(), err))?;
        self.host
            .replace_file(path, &content)
            .map_err(|err| format!("create {}: {}", path.display(), err))?;
        info!("created {} ({} bytes)", path.display(), content.len());
        Ok(())
    }

    /// Creates a guest-made directory and everything inside it. The children
    /// are discovered by parsing the directory's own clusters, which live in
    /// the redo-log (they were written into unmapped space).
    fn create_tree(&mut self, entry: &DirEntry, path: &Path, errors: &mut Vec<String>, depth: u32) {
        if depth > 64 {
            errors.push(format!("{}: directory nesting too deep", path.display()));
            return;
        }
        if let Err(err) = self.host.create_dir(path) {
            errors.push(format!("mkdir {}: {}", path.display(), err));
            return;
        }
        info!("created directory {}", path.display());

        let chain = self
            .commit_fat()
            .chain(entry.first_cluster(), self.layout.cluster_count);
        let span = chain.len() as u64 * self.layout.cluster_size() as u64;
        let bytes = match self.read_chain_content(entry.first_cluster(), span.min(u32::MAX as u64) as u32)
        {
            Ok(bytes) => bytes,
            Err(err) => {
                errors.push(format!("read directory {}: {}", path.display(), err));
                return;
            }
        };

        let mut lfn_chunks: Vec<Vec<u16>> = Vec::new();
        let mut lfn_checksum_byte: u8 = 0;
        for slot in bytes.chunks_exact(DIR_ENTRY_SIZE) {
            let child = DirEntry::from_bytes(slot);
            if child.is_free() || child.is_deleted() || child.is_volume_label() {
                lfn_chunks.clear();
                continue;
            }
            if child.is_long_name() {
                if slot[0] & super::dir_entry::LAST_LONG_ENTRY != 0 {
                    lfn_chunks.clear();
                    lfn_checksum_byte = slot[13];
                }
                lfn_chunks.push(long_name_units(&child));
                continue;
            }
            if child.name[0] == b'.' {
                lfn_chunks.clear();
                continue; // '.' and '..'
            }

            let name = assemble_long_name(&lfn_chunks, lfn_checksum_byte, &child)
                .unwrap_or_else(|| child.host_name());
            lfn_chunks.clear();
            let child_path = path.join(&name);
            if child.is_directory() {
                self.create_tree(&child, &child_path, errors, depth + 1);
            } else if let Err(message) = self.write_new_file(&child, &child_path) {
                errors.push(message);
            }
        }
    }

    /// Drops mappings whose host entries are gone, remapping the indices
    /// other mappings store.
    fn prune_mappings(&mut self, removed: &BTreeSet<usize>) {
        if removed.is_empty() {
            return;
        }
        let len = self.mappings.len();
        let mut new_index: Vec<Option<usize>> = vec![None; len];
        let mut kept: Vec<Mapping> = Vec::with_capacity(len - removed.len());
        for i in 0..len {
            if !removed.contains(&i) {
                new_index[i] = Some(kept.len());
                kept.push(self.mappings[i].clone());
            }
        }
        for mapping in &mut kept {
            mapping.first_mapping_index =
                mapping.first_mapping_index.and_then(|i| new_index[i]);
            if let MappingKind::Directory { ref mut parent, .. } = mapping.kind {
                *parent = parent.and_then(|p| new_index[p]);
            }
        }
        self.mappings.reset();
        for mapping in kept {
            self.mappings.push(mapping);
        }
    }
}

fn sibling_path(path: &Path, name: &str) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn assemble_long_name(chunks: &[Vec<u16>], checksum: u8, entry: &DirEntry) -> Option<String> {
    if chunks.is_empty() {
        return None;
    }
    if checksum != super::dir_entry::lfn_checksum(&entry.short_name()) {
        return None;
    }
    // Slots arrive highest ordinal first; the name reads back to front
    let mut units: Vec<u16> = Vec::with_capacity(chunks.len() * 13);
    for chunk in chunks.iter().rev() {
        units.extend_from_slice(chunk);
    }
    let end = units.iter().position(|&u| u == 0x0000).unwrap_or(units.len());
    units.truncate(end);
    while units.last() == Some(&0xFFFF) {
        units.pop();
    }
    if units.is_empty() {
        return None;
    }
    Some(
        char::decode_utf16(units.into_iter())
            .map(|c| c.unwrap_or('_'))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::super::dir_entry::{ATTR_ARCHIVE, ATTR_DIRECTORY};
    use super::super::image::{ImageOptions, RedologMode, VfatImage};
    use super::super::{ImageError, SECTOR_SIZE};
    use super::*;
    use std::fs;
    use std::io::{Read as IoRead, Seek, SeekFrom, Write as IoWrite};
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    const FLOPPY: u64 = 720 * 1024;

    fn open_floppy(src: &Path) -> VfatImage {
        VfatImage::open(
            src,
            ImageOptions {
                size: FLOPPY,
                redolog: RedologMode::Volatile,
            },
        )
        .unwrap()
    }

    fn setup_with_hello() -> (TempDir, PathBuf, VfatImage) {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("hello.txt"), b"hello").unwrap();
        let image = open_floppy(&src);
        (dir, src, image)
    }

    fn read_sector_at(image: &mut VfatImage, sector: u64) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        image
            .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .unwrap();
        image.read_exact(&mut buf).unwrap();
        buf
    }

    fn write_sector_at(image: &mut VfatImage, sector: u64, data: &[u8; SECTOR_SIZE]) {
        image
            .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
            .unwrap();
        image.write_all(data).unwrap();
    }

    fn patch_sector(
        image: &mut VfatImage,
        sector: u64,
        patch: impl FnOnce(&mut [u8; SECTOR_SIZE]),
    ) {
        let mut buf = read_sector_at(image, sector);
        patch(&mut buf);
        write_sector_at(image, sector, &buf);
    }

    #[test]
    fn test_data_write_then_flush_replaces_host_file() {
        let (_dir, src, mut image) = setup_with_hello();
        let data_sector = image.layout().offset_to_data as u64;

        let mut payload = [0u8; SECTOR_SIZE];
        payload[..5].copy_from_slice(b"howdy");
        write_sector_at(&mut image, data_sector, &payload);
        image.commit_changes().unwrap();

        assert_eq!(fs::read(src.join("hello.txt")).unwrap(), b"howdy");
        image.close().unwrap();

        // A second session over the same directory serves the new bytes
        let mut second = open_floppy(&src);
        let sector = second.layout().offset_to_data as u64;
        let got = read_sector_at(&mut second, sector);
        assert_eq!(&got[..5], b"howdy");
        second.close().unwrap();
    }

    #[test]
    fn test_growing_a_file_through_fat_and_direntry() {
        let (_dir, src, mut image) = setup_with_hello();
        let layout = image.layout().clone();

        // Extend the chain 2 -> 3 in the FAT
        patch_sector(&mut image, layout.offset_to_fat as u64, |buf| {
            let mut fat = super::super::fat::Fat::from_bytes(layout.fat_type, buf.to_vec());
            fat.set(2, 3);
            fat.set(3, fat.end_of_chain());
            buf.copy_from_slice(&fat.as_bytes()[..SECTOR_SIZE]);
        });

        // New content in both clusters
        let first = [b'A'; SECTOR_SIZE];
        write_sector_at(&mut image, layout.cluster_to_sector(2), &first);
        let mut second = [0u8; SECTOR_SIZE];
        second[..488].fill(b'B');
        write_sector_at(&mut image, layout.cluster_to_sector(3), &second);

        // New size in the directory entry
        patch_sector(&mut image, layout.offset_to_root_dir as u64, |buf| {
            buf[32 + 28..32 + 32].copy_from_slice(&1000u32.to_le_bytes());
        });

        image.commit_changes().unwrap();

        let content = fs::read(src.join("hello.txt")).unwrap();
        assert_eq!(content.len(), 1000);
        assert!(content[..512].iter().all(|&b| b == b'A'));
        assert!(content[512..].iter().all(|&b| b == b'B'));
        image.close().unwrap();
    }

    #[test]
    fn test_rename_via_directory_write() {
        let (_dir, src, mut image) = setup_with_hello();
        let root_sector = image.layout().offset_to_root_dir as u64;

        patch_sector(&mut image, root_sector, |buf| {
            buf[32..40].copy_from_slice(b"GREET   ");
        });
        image.commit_changes().unwrap();

        assert!(!src.join("hello.txt").exists());
        assert_eq!(fs::read(src.join("greet.txt")).unwrap(), b"hello");
        image.close().unwrap();
    }

    #[test]
    fn test_delete_via_tombstone() {
        let (_dir, src, mut image) = setup_with_hello();
        let root_sector = image.layout().offset_to_root_dir as u64;

        patch_sector(&mut image, root_sector, |buf| {
            buf[32] = 0xE5;
        });
        image.commit_changes().unwrap();

        assert!(!src.join("hello.txt").exists());
        // The mapping is gone; the cluster now reads back as zeros
        let sector = image.layout().offset_to_data as u64;
        let got = read_sector_at(&mut image, sector);
        assert!(got.iter().all(|&b| b == 0));
        image.close().unwrap();
    }

    #[test]
    fn test_delete_tolerates_already_removed_host_file() {
        let (_dir, src, mut image) = setup_with_hello();
        fs::remove_file(src.join("hello.txt")).unwrap();

        let root_sector = image.layout().offset_to_root_dir as u64;
        patch_sector(&mut image, root_sector, |buf| {
            buf[32] = 0xE5;
        });
        image.commit_changes().unwrap();
        image.close().unwrap();
    }

    #[test]
    fn test_guest_created_file_lands_on_host() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        let mut image = open_floppy(&src);
        let layout = image.layout().clone();

        let mut entry = DirEntry::default();
        entry.name.copy_from_slice(b"NEW     ");
        entry.ext.copy_from_slice(b"TXT");
        entry.attr = ATTR_ARCHIVE;
        entry.set_first_cluster(2);
        entry.size = 3;
        patch_sector(&mut image, layout.offset_to_root_dir as u64, |buf| {
            buf[32..64].copy_from_slice(&entry.to_bytes());
        });

        let mut data = [0u8; SECTOR_SIZE];
        data[..3].copy_from_slice(b"abc");
        write_sector_at(&mut image, layout.cluster_to_sector(2), &data);

        image.commit_changes().unwrap();
        assert_eq!(fs::read(src.join("new.txt")).unwrap(), b"abc");
        image.close().unwrap();
    }

    #[test]
    fn test_guest_created_directory_tree() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        let mut image = open_floppy(&src);
        let layout = image.layout().clone();

        // FAT: two single-cluster chains
        patch_sector(&mut image, layout.offset_to_fat as u64, |buf| {
            let mut fat = super::super::fat::Fat::from_bytes(layout.fat_type, buf.to_vec());
            fat.set(2, fat.end_of_chain());
            fat.set(3, fat.end_of_chain());
            buf.copy_from_slice(&fat.as_bytes()[..SECTOR_SIZE]);
        });

        // Root entry for the new directory
        let mut subdir = DirEntry::default();
        subdir.name.copy_from_slice(b"NEWDIR  ");
        subdir.ext.copy_from_slice(b"   ");
        subdir.attr = ATTR_DIRECTORY;
        subdir.set_first_cluster(2);
        patch_sector(&mut image, layout.offset_to_root_dir as u64, |buf| {
            buf[32..64].copy_from_slice(&subdir.to_bytes());
        });

        // The directory's own cluster: '.', '..', and one file
        let mut dot = DirEntry::default();
        dot.name.copy_from_slice(b".       ");
        dot.ext.copy_from_slice(b"   ");
        dot.attr = ATTR_DIRECTORY;
        dot.set_first_cluster(2);
        let mut dotdot = dot.clone();
        dotdot.name.copy_from_slice(b"..      ");
        dotdot.set_first_cluster(0);
        let mut inner = DirEntry::default();
        inner.name.copy_from_slice(b"INSIDE  ");
        inner.ext.copy_from_slice(b"TXT");
        inner.attr = ATTR_ARCHIVE;
        inner.set_first_cluster(3);
        inner.size = 4;

        let mut cluster = [0u8; SECTOR_SIZE];
        cluster[0..32].copy_from_slice(&dot.to_bytes());
        cluster[32..64].copy_from_slice(&dotdot.to_bytes());
        cluster[64..96].copy_from_slice(&inner.to_bytes());
        write_sector_at(&mut image, layout.cluster_to_sector(2), &cluster);

        let mut data = [0u8; SECTOR_SIZE];
        data[..4].copy_from_slice(b"data");
        write_sector_at(&mut image, layout.cluster_to_sector(3), &data);

        image.commit_changes().unwrap();
        assert!(src.join("newdir").is_dir());
        assert_eq!(fs::read(src.join("newdir").join("inside.txt")).unwrap(), b"data");
        image.close().unwrap();
    }

    #[test]
    fn test_flush_without_writes_leaves_host_untouched() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("hello.txt"), b"hello").unwrap();
        fs::create_dir(src.join("sub")).unwrap();
        fs::write(src.join("sub").join("x.txt"), b"x").unwrap();

        let mut image = open_floppy(&src);
        // Touch the whole disk read-only
        let sectors = image.layout().sector_count as u64;
        let mut buf = [0u8; SECTOR_SIZE];
        for sector in (0..sectors).step_by(97) {
            image
                .seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))
                .unwrap();
            image.read_exact(&mut buf).unwrap();
        }
        image.commit_changes().unwrap();

        let names: Vec<String> = fs::read_dir(&src)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(fs::read(src.join("hello.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(src.join("sub").join("x.txt")).unwrap(), b"x");
        image.close().unwrap();
    }

    #[test]
    fn test_commit_reports_collected_errors() {
        let (_dir, src, mut image) = setup_with_hello();
        // Make the target directory read-only so the rewrite fails
        let data_sector = image.layout().offset_to_data as u64;
        let mut payload = [0u8; SECTOR_SIZE];
        payload[..5].copy_from_slice(b"howdy");
        write_sector_at(&mut image, data_sector, &payload);

        let mut perms = fs::metadata(&src).unwrap().permissions();
        let original = perms.clone();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o555);
        fs::set_permissions(&src, perms).unwrap();

        let result = image.commit_changes();
        fs::set_permissions(&src, original).unwrap();
        match result {
            Err(ImageError::Commit(errors)) => assert_eq!(errors.len(), 1),
            other => panic!("expected commit failure, got {:?}", other),
        }

        // The mark survives, so the next flush retries and succeeds
        image.commit_changes().unwrap();
        assert_eq!(fs::read(src.join("hello.txt")).unwrap(), b"howdy");
        image.close().unwrap();
    }
}
