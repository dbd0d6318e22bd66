// Disk geometry constants
pub const SECTOR_SIZE: usize = 512;
pub const BYTES_PER_SECTOR: u16 = 512;
pub const HDD_SECTORS_PER_TRACK: u16 = 63;
pub const HDD_HEADS: u16 = 16;
pub const FLOPPY_SECTORS_PER_TRACK: u16 = 18;
pub const FLOPPY_HEADS: u16 = 2;

// MBR constants
pub const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const PARTITION_ENTRY_SIZE: usize = 16;
pub const NUM_PARTITIONS: usize = 4;
pub const PARTITION_TABLE_OFFSET: usize = 446;

// FAT constants
pub const MEDIA_DESCRIPTOR_HDD: u8 = 0xF8; // Fixed disk
pub const MEDIA_DESCRIPTOR_FLOPPY: u8 = 0xF0;
pub const FAT12_MAX_CLUSTERS: u32 = 4085; // Cluster counts at or above this need FAT16
pub const FAT16_MAX_CLUSTERS: u32 = 65525;
pub const FAT16_ROOT_ENTRIES: u16 = 512;
pub const FAT12_ROOT_ENTRIES: u16 = 224;
pub const RESERVED_SECTORS: u16 = 1; // Boot sector
pub const NUMBER_OF_FATS: u8 = 2; // Two copies of FAT
pub const DIR_ENTRY_SIZE: usize = 32;

// Partition table starts one track in when the image carries an MBR
pub const PARTITION_START_LBA: u32 = HDD_SECTORS_PER_TRACK as u32;

pub mod array;
pub mod boot_sector;
pub mod commit;
pub mod dir_entry;
pub mod fat;
pub mod hostfs;
pub mod image;
pub mod mapping;
pub mod mbr;

pub use boot_sector::{BootSector, FatType, Layout};
pub use dir_entry::DirEntry;
pub use fat::Fat;
pub use hostfs::{HostEntry, HostFs, LocalFs};
pub use image::{ImageOptions, RedologMode, VfatImage};
pub use mapping::{Mapping, MappingKind, MappingState};
pub use mbr::{Mbr, PartitionEntry};

use std::fmt;
use std::io;

/// Errors surfaced by image construction, serving, and commit.
#[derive(Debug)]
pub enum ImageError {
    /// The requested disk size cannot be expressed as FAT12/16.
    ConfigInvalid(String),
    /// A host entry could not be enumerated or stat'ed during the build.
    HostScanFailed(String),
    /// The host tree exceeds the virtual disk capacity.
    OutOfSpace,
    /// Redo-log header mismatch; carries the numeric check code.
    ImageFormat(i32),
    /// Transient host filesystem error.
    Io(io::Error),
    /// One or more per-entry failures collected during commit.
    Commit(Vec<String>),
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::ConfigInvalid(msg) => write!(f, "invalid disk configuration: {}", msg),
            ImageError::HostScanFailed(msg) => write!(f, "host directory scan failed: {}", msg),
            ImageError::OutOfSpace => write!(f, "host tree exceeds virtual disk capacity"),
            ImageError::ImageFormat(code) => write!(f, "redo-log format check failed ({})", code),
            ImageError::Io(err) => write!(f, "I/O error: {}", err),
            ImageError::Commit(errors) => {
                write!(f, "commit finished with {} failure(s): ", errors.len())?;
                write!(f, "{}", errors.join("; "))
            }
        }
    }
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ImageError {
    fn from(err: io::Error) -> Self {
        ImageError::Io(err)
    }
}
