use std::time::SystemTime;

use super::dir_entry::fat_datetime;
use super::{
    ImageError, BYTES_PER_SECTOR, FAT12_MAX_CLUSTERS, FAT12_ROOT_ENTRIES, FAT16_MAX_CLUSTERS,
    FAT16_ROOT_ENTRIES, FLOPPY_HEADS, FLOPPY_SECTORS_PER_TRACK, HDD_HEADS, HDD_SECTORS_PER_TRACK,
    MEDIA_DESCRIPTOR_FLOPPY, MEDIA_DESCRIPTOR_HDD, NUMBER_OF_FATS, PARTITION_START_LBA,
    RESERVED_SECTORS, SECTOR_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
}

impl FatType {
    pub fn fs_type_label(&self) -> &'static [u8; 8] {
        match self {
            FatType::Fat12 => b"FAT12   ",
            FatType::Fat16 => b"FAT16   ",
        }
    }
}

/// Fixed disk geometry, decided once from the requested size.
///
/// All offsets are in sectors from the start of the virtual disk. Images of
/// 1 MiB and up get an MBR with the filesystem one track in; smaller images
/// are laid out floppy-style with the boot sector at sector 0.
#[derive(Debug, Clone)]
pub struct Layout {
    pub sector_count: u32,
    pub fat_type: FatType,
    pub sectors_per_cluster: u8,
    pub sectors_per_fat: u32,
    pub reserved_sectors: u16,
    pub root_entries: u16,
    pub media_descriptor: u8,
    pub heads: u16,
    pub sectors_per_track: u16,
    pub cluster_count: u32,
    pub offset_to_bootsector: u32,
    pub offset_to_fat: u32,
    pub offset_to_root_dir: u32,
    pub offset_to_data: u32,
}

impl Layout {
    pub fn for_size(size: u64) -> Result<Layout, ImageError> {
        if size == 0 || size % SECTOR_SIZE as u64 != 0 {
            return Err(ImageError::ConfigInvalid(format!(
                "disk size {} is not a multiple of the sector size",
                size
            )));
        }
        if size > 2047 * 1024 * 1024 {
            return Err(ImageError::ConfigInvalid(format!(
                "disk size {} exceeds the FAT16 limit",
                size
            )));
        }

        let sector_count = (size / SECTOR_SIZE as u64) as u32;
        let has_mbr = size >= 1024 * 1024;
        let (offset_to_bootsector, heads, sectors_per_track, media_descriptor, root_entries) =
            if has_mbr {
                (PARTITION_START_LBA, HDD_HEADS, HDD_SECTORS_PER_TRACK, MEDIA_DESCRIPTOR_HDD, FAT16_ROOT_ENTRIES)
            } else {
                (0, FLOPPY_HEADS, FLOPPY_SECTORS_PER_TRACK, MEDIA_DESCRIPTOR_FLOPPY, FAT12_ROOT_ENTRIES)
            };

        let root_dir_sectors =
            (root_entries as u32 * 32 + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32;
        let available = sector_count
            .checked_sub(offset_to_bootsector + RESERVED_SECTORS as u32 + root_dir_sectors)
            .filter(|&s| s > 0)
            .ok_or_else(|| {
                ImageError::ConfigInvalid(format!("disk size {} is too small for FAT", size))
            })?;

        for shift in 0..8u32 {
            let sectors_per_cluster = 1u32 << shift;
            // sectors_per_fat and cluster_count depend on each other;
            // iterate to the fixed point (converges in a couple of rounds)
            let mut sectors_per_fat = 1u32;
            let (mut cluster_count, fat_type) = loop {
                let data_sectors = match available.checked_sub(2 * sectors_per_fat) {
                    Some(s) => s,
                    None => break (0, FatType::Fat12),
                };
                let cluster_count = data_sectors / sectors_per_cluster;
                let fat_type = if cluster_count < FAT12_MAX_CLUSTERS {
                    FatType::Fat12
                } else {
                    FatType::Fat16
                };
                let needed = match fat_type {
                    FatType::Fat12 => ((cluster_count + 2) * 3 / 2 + SECTOR_SIZE as u32 - 1)
                        / SECTOR_SIZE as u32,
                    FatType::Fat16 => ((cluster_count + 2) * 2 + SECTOR_SIZE as u32 - 1)
                        / SECTOR_SIZE as u32,
                };
                if needed <= sectors_per_fat {
                    break (cluster_count, fat_type);
                }
                sectors_per_fat = needed;
            };

            if cluster_count == 0 {
                continue;
            }
            // Never let the cluster count outrun what the FAT can address
            let fat_capacity = match fat_type {
                FatType::Fat12 => sectors_per_fat * SECTOR_SIZE as u32 * 2 / 3,
                FatType::Fat16 => sectors_per_fat * SECTOR_SIZE as u32 / 2,
            };
            cluster_count = cluster_count.min(fat_capacity - 2);
            if cluster_count >= FAT16_MAX_CLUSTERS {
                continue; // cluster too small for this disk, double it
            }

            let offset_to_fat = offset_to_bootsector + RESERVED_SECTORS as u32;
            let offset_to_root_dir = offset_to_fat + NUMBER_OF_FATS as u32 * sectors_per_fat;
            let offset_to_data = offset_to_root_dir + root_dir_sectors;
            return Ok(Layout {
                sector_count,
                fat_type,
                sectors_per_cluster: sectors_per_cluster as u8,
                sectors_per_fat,
                reserved_sectors: RESERVED_SECTORS,
                root_entries,
                media_descriptor,
                heads,
                sectors_per_track,
                cluster_count,
                offset_to_bootsector,
                offset_to_fat,
                offset_to_root_dir,
                offset_to_data,
            });
        }

        Err(ImageError::ConfigInvalid(format!(
            "no FAT12/16 cluster geometry fits a disk of {} bytes",
            size
        )))
    }

    pub fn cluster_size(&self) -> u32 {
        self.sectors_per_cluster as u32 * SECTOR_SIZE as u32
    }

    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.offset_to_data as u64
            + (cluster as u64 - 2) * self.sectors_per_cluster as u64
    }

    pub fn sector_to_cluster(&self, sector: u64) -> u32 {
        ((sector - self.offset_to_data as u64) / self.sectors_per_cluster as u64) as u32 + 2
    }

    pub fn entries_per_cluster(&self) -> usize {
        self.cluster_size() as usize / super::DIR_ENTRY_SIZE
    }
}

/// Boot sector with BIOS parameter block, serialized to its on-disk layout.
pub struct BootSector {
    pub layout: Layout,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
}

impl BootSector {
    pub fn new(layout: Layout, volume_label: [u8; 11], created: SystemTime) -> Self {
        let (date, time) = fat_datetime(created);
        BootSector {
            layout,
            volume_id: (date as u32) << 16 | time as u32,
            volume_label,
        }
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let l = &self.layout;
        let mut bytes = [0u8; SECTOR_SIZE];
        bytes[0..3].copy_from_slice(&[0xEB, 0x3E, 0x90]); // jmp + nop
        bytes[3..11].copy_from_slice(b"BOCHS   ");
        bytes[11..13].copy_from_slice(&BYTES_PER_SECTOR.to_le_bytes());
        bytes[13] = l.sectors_per_cluster;
        bytes[14..16].copy_from_slice(&l.reserved_sectors.to_le_bytes());
        bytes[16] = NUMBER_OF_FATS;
        bytes[17..19].copy_from_slice(&l.root_entries.to_le_bytes());
        if l.sector_count < 0x10000 {
            bytes[19..21].copy_from_slice(&(l.sector_count as u16).to_le_bytes());
        }
        bytes[21] = l.media_descriptor;
        bytes[22..24].copy_from_slice(&(l.sectors_per_fat as u16).to_le_bytes());
        bytes[24..26].copy_from_slice(&l.sectors_per_track.to_le_bytes());
        bytes[26..28].copy_from_slice(&l.heads.to_le_bytes());
        bytes[28..32].copy_from_slice(&l.offset_to_bootsector.to_le_bytes()); // hidden
        if l.sector_count >= 0x10000 {
            bytes[32..36].copy_from_slice(&l.sector_count.to_le_bytes());
        }
        bytes[36] = if l.offset_to_bootsector > 0 { 0x80 } else { 0x00 }; // drive number
        bytes[38] = 0x29; // extended boot signature
        bytes[39..43].copy_from_slice(&self.volume_id.to_le_bytes());
        bytes[43..54].copy_from_slice(&self.volume_label);
        bytes[54..62].copy_from_slice(l.fat_type.fs_type_label());
        bytes[SECTOR_SIZE - 2] = 0x55;
        bytes[SECTOR_SIZE - 1] = 0xAA;
        bytes
    }
}

/// Volume label from a directory name: uppercased, padded to 11 bytes.
pub fn volume_label_for(dir_name: &str) -> [u8; 11] {
    let mut label = [b' '; 11];
    for (i, c) in dir_name.chars().take(11).enumerate() {
        label[i] = if c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-' {
            c.to_ascii_uppercase() as u8
        } else {
            b'_'
        };
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_128_mib_is_fat16() {
        let layout = Layout::for_size(128 * 1024 * 1024).unwrap();
        assert_eq!(layout.sector_count, 262144);
        assert_eq!(layout.fat_type, FatType::Fat16);
        assert_eq!(layout.offset_to_bootsector, 63);
        assert_eq!(layout.root_entries, 512);
        assert_eq!(layout.media_descriptor, 0xF8);
        assert!(layout.cluster_count < FAT16_MAX_CLUSTERS);
        assert!(layout.cluster_count >= FAT12_MAX_CLUSTERS);

        // Region offsets line up back to back
        assert_eq!(layout.offset_to_fat, 64);
        assert_eq!(
            layout.offset_to_root_dir,
            layout.offset_to_fat + 2 * layout.sectors_per_fat
        );
        assert_eq!(layout.offset_to_data, layout.offset_to_root_dir + 32);

        // The whole data region is addressable through the FAT
        let fat_capacity = layout.sectors_per_fat * 512 * 8 / 16;
        assert!(layout.cluster_count + 2 <= fat_capacity);
    }

    #[test]
    fn test_layout_floppy_is_fat12() {
        let layout = Layout::for_size(720 * 1024).unwrap();
        assert_eq!(layout.fat_type, FatType::Fat12);
        assert_eq!(layout.offset_to_bootsector, 0);
        assert_eq!(layout.root_entries, 224);
        assert_eq!(layout.media_descriptor, 0xF0);
        assert_eq!(layout.sectors_per_cluster, 1);
        assert_eq!(layout.heads, 2);
        assert_eq!(layout.sectors_per_track, 18);
        assert!(layout.cluster_count < FAT12_MAX_CLUSTERS);
    }

    #[test]
    fn test_layout_rejects_degenerate_sizes() {
        assert!(Layout::for_size(0).is_err());
        assert!(Layout::for_size(513).is_err());
        assert!(Layout::for_size(3 * 1024 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_cluster_sector_round_trip() {
        let layout = Layout::for_size(128 * 1024 * 1024).unwrap();
        let sector = layout.cluster_to_sector(2);
        assert_eq!(sector, layout.offset_to_data as u64);
        assert_eq!(layout.sector_to_cluster(sector), 2);

        let sector = layout.cluster_to_sector(100);
        assert_eq!(layout.sector_to_cluster(sector), 100);
        assert_eq!(
            layout.sector_to_cluster(sector + layout.sectors_per_cluster as u64 - 1),
            100
        );
    }

    #[test]
    fn test_boot_sector_bpb_fields() {
        let layout = Layout::for_size(128 * 1024 * 1024).unwrap();
        let label = volume_label_for("empty");
        let boot = BootSector::new(layout.clone(), label, SystemTime::now());
        let bytes = boot.to_bytes();

        assert_eq!(&bytes[0..3], &[0xEB, 0x3E, 0x90]);
        assert_eq!(&bytes[3..11], b"BOCHS   ");
        assert_eq!(u16::from_le_bytes([bytes[11], bytes[12]]), 512);
        assert_eq!(bytes[13], layout.sectors_per_cluster);
        assert_eq!(u16::from_le_bytes([bytes[14], bytes[15]]), 1);
        assert_eq!(bytes[16], 2);
        assert_eq!(u16::from_le_bytes([bytes[17], bytes[18]]), 512);
        // 262144 sectors does not fit the 16-bit field
        assert_eq!(u16::from_le_bytes([bytes[19], bytes[20]]), 0);
        assert_eq!(
            u32::from_le_bytes([bytes[32], bytes[33], bytes[34], bytes[35]]),
            262144
        );
        assert_eq!(bytes[21], 0xF8);
        assert_eq!(bytes[38], 0x29);
        assert_eq!(&bytes[43..54], b"EMPTY      ");
        assert_eq!(&bytes[54..62], b"FAT16   ");
        assert_eq!(&bytes[510..512], &[0x55, 0xAA]);
    }

    #[test]
    fn test_floppy_boot_sector_reports_16_bit_total() {
        let layout = Layout::for_size(720 * 1024).unwrap();
        let boot = BootSector::new(layout, volume_label_for("floppy"), SystemTime::now());
        let bytes = boot.to_bytes();
        assert_eq!(u16::from_le_bytes([bytes[19], bytes[20]]), 1440);
        assert_eq!(&bytes[54..62], b"FAT12   ");
    }
}
