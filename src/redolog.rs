/*
 * Redo-log Block Store
 * ====================
 *
 * Block-granular copy-on-write log. Guest writes land here out-of-place;
 * reads check the log first and fall back to the virtual disk when a sector
 * was never written.
 *
 * On-disk layout (all fields little-endian):
 *   [0..512)   header: magic, type, subtype, version, header size, then
 *              catalog entries / bitmap bytes / extent bytes / timestamp /
 *              disk size, zero-padded
 *   [512..)    catalog: one u32 per extent, 0xFFFFFFFF = never written
 *   then       extents in allocation order, each a sector bitmap followed
 *              by the extent's data sectors
 *
 * The "Undoable" subtype persists across sessions; "Volatile" lives in a
 * mkstemp-style temp file that is removed on close.
 */

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::SystemTime;

use log::{debug, info};
use tempfile::{Builder as TempBuilder, TempPath};

use crate::vfat::dir_entry::fat_datetime;
use crate::vfat::ImageError;
use crate::vfat::SECTOR_SIZE;

pub const STANDARD_HEADER_MAGIC: &[u8] = b"Bochs Virtual HD Image";
pub const REDOLOG_TYPE: &str = "Redolog";
pub const STANDARD_HEADER_V1: u32 = 0x0001_0000;
pub const STANDARD_HEADER_VERSION: u32 = 0x0002_0000;
pub const STANDARD_HEADER_SIZE: u32 = 512;
pub const REDOLOG_PAGE_NOT_ALLOCATED: u32 = 0xFFFF_FFFF;

/// Capability bit: the image carries explicit CHS geometry.
pub const HDIMAGE_HAS_GEOMETRY: u32 = 2;

// Format check results
pub const HDIMAGE_FORMAT_OK: i32 = 0;
pub const HDIMAGE_SIZE_ERROR: i32 = -1;
pub const HDIMAGE_READ_ERROR: i32 = -2;
pub const HDIMAGE_NO_SIGNATURE: i32 = -3;
pub const HDIMAGE_TYPE_ERROR: i32 = -4;
pub const HDIMAGE_VERSION_ERROR: i32 = -5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedologSubtype {
    Undoable,
    Volatile,
    Growing,
}

impl RedologSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedologSubtype::Undoable => "Undoable",
            RedologSubtype::Volatile => "Volatile",
            RedologSubtype::Growing => "Growing",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedologHeader {
    pub subtype: RedologSubtype,
    pub version: u32,
    /// Number of catalog entries.
    pub catalog: u32,
    /// Bitmap size per extent, in bytes.
    pub bitmap: u32,
    /// Extent data size, in bytes.
    pub extent: u32,
    /// Modification time in FAT format ("Undoable" only, v2 only).
    pub timestamp: u32,
    /// Disk size in bytes.
    pub disk: u64,
}

impl RedologHeader {
    /// Derives catalog/bitmap/extent sizes for `size` by alternately doubling
    /// the catalog entry count and the per-extent bitmap until the log can
    /// cover the whole disk.
    pub fn make(subtype: RedologSubtype, size: u64) -> Self {
        let mut entries: u32 = 512;
        let mut bitmap_size: u32 = 1;
        let mut flip = 0;
        loop {
            let extent_size = 8 * bitmap_size * SECTOR_SIZE as u32;
            if entries as u64 * extent_size as u64 >= size {
                break;
            }
            if flip & 1 == 1 {
                entries *= 2;
            } else {
                bitmap_size *= 2;
            }
            flip += 1;
        }
        RedologHeader {
            subtype,
            version: STANDARD_HEADER_VERSION,
            catalog: entries,
            bitmap: bitmap_size,
            extent: 8 * bitmap_size * SECTOR_SIZE as u32,
            timestamp: 0,
            disk: size,
        }
    }

    pub fn to_bytes(&self) -> [u8; STANDARD_HEADER_SIZE as usize] {
        let mut bytes = [0u8; STANDARD_HEADER_SIZE as usize];
        bytes[..STANDARD_HEADER_MAGIC.len()].copy_from_slice(STANDARD_HEADER_MAGIC);
        bytes[32..32 + REDOLOG_TYPE.len()].copy_from_slice(REDOLOG_TYPE.as_bytes());
        let subtype = self.subtype.as_str().as_bytes();
        bytes[48..48 + subtype.len()].copy_from_slice(subtype);
        bytes[64..68].copy_from_slice(&self.version.to_le_bytes());
        bytes[68..72].copy_from_slice(&STANDARD_HEADER_SIZE.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.catalog.to_le_bytes());
        bytes[76..80].copy_from_slice(&self.bitmap.to_le_bytes());
        bytes[80..84].copy_from_slice(&self.extent.to_le_bytes());
        bytes[84..88].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[88..96].copy_from_slice(&self.disk.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, i32> {
        if bytes.len() < STANDARD_HEADER_SIZE as usize {
            return Err(HDIMAGE_READ_ERROR);
        }
        if !c_string_matches(&bytes[0..32], STANDARD_HEADER_MAGIC) {
            return Err(HDIMAGE_NO_SIGNATURE);
        }
        if !c_string_matches(&bytes[32..48], REDOLOG_TYPE.as_bytes()) {
            return Err(HDIMAGE_TYPE_ERROR);
        }
        let subtype = if c_string_matches(&bytes[48..64], b"Undoable") {
            RedologSubtype::Undoable
        } else if c_string_matches(&bytes[48..64], b"Volatile") {
            RedologSubtype::Volatile
        } else if c_string_matches(&bytes[48..64], b"Growing") {
            RedologSubtype::Growing
        } else {
            return Err(HDIMAGE_TYPE_ERROR);
        };
        let version = u32::from_le_bytes(bytes[64..68].try_into().unwrap());
        if version != STANDARD_HEADER_VERSION && version != STANDARD_HEADER_V1 {
            return Err(HDIMAGE_VERSION_ERROR);
        }
        let timestamp = if version == STANDARD_HEADER_VERSION {
            u32::from_le_bytes(bytes[84..88].try_into().unwrap())
        } else {
            0
        };
        Ok(RedologHeader {
            subtype,
            version,
            catalog: u32::from_le_bytes(bytes[72..76].try_into().unwrap()),
            bitmap: u32::from_le_bytes(bytes[76..80].try_into().unwrap()),
            extent: u32::from_le_bytes(bytes[80..84].try_into().unwrap()),
            timestamp,
            disk: u64::from_le_bytes(bytes[88..96].try_into().unwrap()),
        })
    }

    pub fn extent_blocks(&self) -> u32 {
        self.extent / SECTOR_SIZE as u32
    }
}

fn c_string_matches(field: &[u8], expected: &[u8]) -> bool {
    field.len() > expected.len()
        && &field[..expected.len()] == expected
        && field[expected.len()] == 0
}

/// Validates a redo-log header against the expected subtype. Mirrors the
/// numeric result codes callers switch on.
pub fn check_format<R: Read + Seek>(file: &mut R, subtype: RedologSubtype) -> i32 {
    let mut bytes = [0u8; STANDARD_HEADER_SIZE as usize];
    if file.seek(SeekFrom::Start(0)).is_err() || file.read_exact(&mut bytes).is_err() {
        return HDIMAGE_READ_ERROR;
    }
    match RedologHeader::from_bytes(&bytes) {
        Ok(header) if header.subtype == subtype => HDIMAGE_FORMAT_OK,
        Ok(_) => HDIMAGE_TYPE_ERROR,
        Err(code) => code,
    }
}

#[derive(Debug)]
pub struct Redolog {
    file: File,
    header: RedologHeader,
    catalog: Vec<u32>,
    /// Bitmap of the most recently touched extent.
    bitmap: Vec<u8>,
    bitmap_extent: Option<u32>,
    /// Next allocation slot at the end of the file.
    extent_next: u32,
    /// Keeps a volatile log's backing file alive; dropping removes it.
    temp_path: Option<TempPath>,
    /// Position for the std::io interface.
    pos: u64,
}

impl Redolog {
    pub fn create(path: &Path, subtype: RedologSubtype, size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        info!("creating {} redo-log {}", subtype.as_str(), path.display());
        Self::create_from_file(file, subtype, size, None)
    }

    /// Volatile log in a `<hint>.XXXXXX`-style temp file next to `hint`.
    pub fn create_volatile(hint: &Path, size: u64) -> io::Result<Self> {
        let parent = hint.parent().filter(|p| !p.as_os_str().is_empty());
        let stem = hint
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fatmirror.redolog".to_string());
        let prefix = format!("{}.", stem);
        let mut builder = TempBuilder::new();
        builder.prefix(&prefix).rand_bytes(6);
        let builder_result = match parent {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        // Fall back to the system temp dir if the hint's directory is not
        // writable
        let named = match builder_result {
            Ok(named) => named,
            Err(_) => builder.tempfile()?,
        };
        info!("volatile redo-log at {}", named.path().display());
        let (file, temp_path) = named.into_parts();
        Self::create_from_file(file, RedologSubtype::Volatile, size, Some(temp_path))
    }

    fn create_from_file(
        mut file: File,
        subtype: RedologSubtype,
        size: u64,
        temp_path: Option<TempPath>,
    ) -> io::Result<Self> {
        let header = RedologHeader::make(subtype, size);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.to_bytes())?;
        file.write_all(&vec![0xFF; header.catalog as usize * 4])?;
        file.flush()?;
        debug!(
            "redo-log geometry: {} catalog entries, {} byte bitmaps, {} byte extents",
            header.catalog, header.bitmap, header.extent
        );
        let catalog = vec![REDOLOG_PAGE_NOT_ALLOCATED; header.catalog as usize];
        let bitmap = vec![0u8; header.bitmap as usize];
        Ok(Redolog {
            file,
            header,
            catalog,
            bitmap,
            bitmap_extent: None,
            extent_next: 0,
            temp_path,
            pos: 0,
        })
    }

    pub fn open(
        path: &Path,
        subtype: RedologSubtype,
        expected_size: Option<u64>,
    ) -> Result<Self, ImageError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let code = check_format(&mut file, subtype);
        if code != HDIMAGE_FORMAT_OK {
            return Err(ImageError::ImageFormat(code));
        }

        let mut bytes = [0u8; STANDARD_HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut bytes)?;
        let header = RedologHeader::from_bytes(&bytes).map_err(ImageError::ImageFormat)?;
        if let Some(size) = expected_size {
            if header.disk != size {
                return Err(ImageError::ImageFormat(HDIMAGE_SIZE_ERROR));
            }
        }

        let mut raw = vec![0u8; header.catalog as usize * 4];
        file.read_exact(&mut raw)?;
        let catalog: Vec<u32> = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let extent_next = catalog
            .iter()
            .filter(|&&entry| entry != REDOLOG_PAGE_NOT_ALLOCATED)
            .map(|&entry| entry + 1)
            .max()
            .unwrap_or(0);

        info!(
            "opened {} redo-log {} ({} of {} extents in use)",
            header.subtype.as_str(),
            path.display(),
            extent_next,
            header.catalog
        );
        let bitmap = vec![0u8; header.bitmap as usize];
        Ok(Redolog {
            file,
            header,
            catalog,
            bitmap,
            bitmap_extent: None,
            extent_next,
            temp_path: None,
            pos: 0,
        })
    }

    pub fn header(&self) -> &RedologHeader {
        &self.header
    }

    pub fn get_size(&self) -> u64 {
        self.header.disk
    }

    pub fn get_timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) -> io::Result<()> {
        self.header.timestamp = timestamp;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.to_bytes())
    }

    /// True when the catalog has an extent for `extent_index`.
    pub fn is_allocated(&self, extent_index: u32) -> bool {
        self.catalog
            .get(extent_index as usize)
            .map(|&entry| entry != REDOLOG_PAGE_NOT_ALLOCATED)
            .unwrap_or(false)
    }

    fn data_start(&self) -> u64 {
        STANDARD_HEADER_SIZE as u64 + self.catalog.len() as u64 * 4
    }

    fn extent_disk_offset(&self, allocation: u32) -> u64 {
        self.data_start()
            + allocation as u64 * (self.header.bitmap as u64 + self.header.extent as u64)
    }

    fn load_bitmap(&mut self, extent_index: u32, allocation: u32) -> io::Result<()> {
        if self.bitmap_extent == Some(extent_index) {
            return Ok(());
        }
        let offset = self.extent_disk_offset(allocation);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut self.bitmap)?;
        self.bitmap_extent = Some(extent_index);
        Ok(())
    }

    /// Reads one sector at byte offset `pos`. Returns false when the sector
    /// was never written, so the caller falls through to its base image.
    pub fn read_sector(&mut self, pos: u64, out: &mut [u8]) -> io::Result<bool> {
        let extent_index = (pos / self.header.extent as u64) as u32;
        if extent_index as usize >= self.catalog.len() {
            return Ok(false);
        }
        let allocation = self.catalog[extent_index as usize];
        if allocation == REDOLOG_PAGE_NOT_ALLOCATED {
            return Ok(false);
        }
        let extent_offset = pos % self.header.extent as u64;
        let sector_in_extent = (extent_offset / SECTOR_SIZE as u64) as usize;

        self.load_bitmap(extent_index, allocation)?;
        if self.bitmap[sector_in_extent / 8] & (1 << (sector_in_extent % 8)) == 0 {
            return Ok(false);
        }

        let offset = self.extent_disk_offset(allocation) + self.header.bitmap as u64 + extent_offset;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(out)?;
        Ok(true)
    }

    /// Writes one sector at byte offset `pos`, allocating the covering
    /// extent on first touch.
    pub fn write_sector(&mut self, pos: u64, data: &[u8]) -> io::Result<()> {
        let extent_index = (pos / self.header.extent as u64) as u32;
        if extent_index as usize >= self.catalog.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write beyond redo-log capacity",
            ));
        }
        let mut allocation = self.catalog[extent_index as usize];
        if allocation == REDOLOG_PAGE_NOT_ALLOCATED {
            allocation = self.extent_next;
            self.extent_next += 1;
            self.catalog[extent_index as usize] = allocation;
            debug!("allocating extent {} for index {}", allocation, extent_index);

            // Persist the catalog entry, then a cleared bitmap
            self.file.seek(SeekFrom::Start(
                STANDARD_HEADER_SIZE as u64 + extent_index as u64 * 4,
            ))?;
            self.file.write_all(&allocation.to_le_bytes())?;
            self.file
                .seek(SeekFrom::Start(self.extent_disk_offset(allocation)))?;
            self.file.write_all(&vec![0u8; self.header.bitmap as usize])?;
            self.bitmap.fill(0);
            self.bitmap_extent = Some(extent_index);
        }

        let extent_offset = pos % self.header.extent as u64;
        let sector_in_extent = (extent_offset / SECTOR_SIZE as u64) as usize;

        self.load_bitmap(extent_index, allocation)?;
        if self.bitmap[sector_in_extent / 8] & (1 << (sector_in_extent % 8)) == 0 {
            self.bitmap[sector_in_extent / 8] |= 1 << (sector_in_extent % 8);
            self.file.seek(SeekFrom::Start(
                self.extent_disk_offset(allocation) + (sector_in_extent / 8) as u64,
            ))?;
            self.file
                .write_all(&[self.bitmap[sector_in_extent / 8]])?;
        }

        let offset = self.extent_disk_offset(allocation) + self.header.bitmap as u64 + extent_offset;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    /// Replays every written sector into `base`. Returns the sector count.
    pub fn commit_to<T: Write + Seek>(&mut self, base: &mut T) -> io::Result<u32> {
        let mut replayed = 0;
        let extent_blocks = self.header.extent_blocks() as usize;
        let mut sector = vec![0u8; SECTOR_SIZE];
        for extent_index in 0..self.catalog.len() {
            let allocation = self.catalog[extent_index];
            if allocation == REDOLOG_PAGE_NOT_ALLOCATED {
                continue;
            }
            self.load_bitmap(extent_index as u32, allocation)?;
            let bitmap = self.bitmap.clone();
            for block in 0..extent_blocks {
                if bitmap[block / 8] & (1 << (block % 8)) == 0 {
                    continue;
                }
                let pos = extent_index as u64 * self.header.extent as u64
                    + block as u64 * SECTOR_SIZE as u64;
                if !self.read_sector(pos, &mut sector)? {
                    continue;
                }
                base.seek(SeekFrom::Start(pos))?;
                base.write_all(&sector)?;
                replayed += 1;
            }
        }
        base.flush()?;
        Ok(replayed)
    }

    /// Finishes the session. An "Undoable" log gets its header stamped with
    /// the current FAT-format time; a "Volatile" log's file is removed.
    pub fn close(mut self) -> io::Result<()> {
        if self.header.subtype == RedologSubtype::Undoable {
            let (date, time) = fat_datetime(SystemTime::now());
            self.set_timestamp((date as u32) << 16 | time as u32)?;
        }
        self.file.sync_all()?;
        drop(self.temp_path.take());
        Ok(())
    }
}

// The log serves the same positional sector interface as the image it
// shadows; sectors never written read back as zeros here.
impl Seek for Redolog {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.header.disk as i64 + offset,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of redo-log",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

impl Read for Redolog {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.header.disk;
        if self.pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((size - self.pos) as usize);
        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < want {
            let position = self.pos + done as u64;
            let sector_start = position - position % SECTOR_SIZE as u64;
            let intra = (position % SECTOR_SIZE as u64) as usize;
            sector_buf.fill(0);
            self.read_sector(sector_start, &mut sector_buf)?;
            let chunk = (SECTOR_SIZE - intra).min(want - done);
            buf[done..done + chunk].copy_from_slice(&sector_buf[intra..intra + chunk]);
            done += chunk;
        }
        self.pos += done as u64;
        Ok(done)
    }
}

impl Write for Redolog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size = self.header.disk;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write past end of redo-log",
            ));
        }
        let want = buf.len().min((size - self.pos) as usize);
        let mut done = 0;
        while done < want {
            let position = self.pos + done as u64;
            let sector_start = position - position % SECTOR_SIZE as u64;
            let intra = (position % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - intra).min(want - done);
            if intra == 0 && chunk == SECTOR_SIZE {
                self.write_sector(sector_start, &buf[done..done + SECTOR_SIZE])?;
            } else {
                let mut sector_buf = [0u8; SECTOR_SIZE];
                self.read_sector(sector_start, &mut sector_buf)?;
                sector_buf[intra..intra + chunk].copy_from_slice(&buf[done..done + chunk]);
                self.write_sector(sector_start, &sector_buf)?;
            }
            done += chunk;
        }
        self.pos += done as u64;
        Ok(done)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}
