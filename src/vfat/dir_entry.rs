use std::collections::HashSet;
use std::time::SystemTime;

use chrono::{DateTime, Datelike, Local, Timelike};

use super::DIR_ENTRY_SIZE;

// Attribute bits
pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = 0x0F;

pub const DELETED_MARKER: u8 = 0xE5;
pub const LAST_LONG_ENTRY: u8 = 0x40;

/// Characters accepted verbatim in a short name (besides letters and digits).
const SHORT_NAME_PUNCT: &[u8] = b"$%'-_@~`!(){}^#&";

/// One 32-byte FAT directory record.
///
/// Long-filename slots share this layout; their payload is carried in the
/// same fields and survives serialization byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: [u8; 8],
    pub ext: [u8; 3],
    pub attr: u8,
    pub reserved: [u8; 2],
    pub ctime: u16,
    pub cdate: u16,
    pub adate: u16,
    pub begin_hi: u16,
    pub mtime: u16,
    pub mdate: u16,
    pub begin: u16,
    pub size: u32,
}

impl Default for DirEntry {
    fn default() -> Self {
        DirEntry {
            name: [0; 8],
            ext: [0; 3],
            attr: 0,
            reserved: [0; 2],
            ctime: 0,
            cdate: 0,
            adate: 0,
            begin_hi: 0,
            mtime: 0,
            mdate: 0,
            begin: 0,
            size: 0,
        }
    }
}

impl DirEntry {
    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut bytes = [0u8; DIR_ENTRY_SIZE];
        bytes[0..8].copy_from_slice(&self.name);
        bytes[8..11].copy_from_slice(&self.ext);
        bytes[11] = self.attr;
        bytes[12..14].copy_from_slice(&self.reserved);
        bytes[14..16].copy_from_slice(&self.ctime.to_le_bytes());
        bytes[16..18].copy_from_slice(&self.cdate.to_le_bytes());
        bytes[18..20].copy_from_slice(&self.adate.to_le_bytes());
        bytes[20..22].copy_from_slice(&self.begin_hi.to_le_bytes());
        bytes[22..24].copy_from_slice(&self.mtime.to_le_bytes());
        bytes[24..26].copy_from_slice(&self.mdate.to_le_bytes());
        bytes[26..28].copy_from_slice(&self.begin.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        let mut name = [0u8; 8];
        let mut ext = [0u8; 3];
        name.copy_from_slice(&data[0..8]);
        ext.copy_from_slice(&data[8..11]);
        DirEntry {
            name,
            ext,
            attr: data[11],
            reserved: [data[12], data[13]],
            ctime: u16::from_le_bytes([data[14], data[15]]),
            cdate: u16::from_le_bytes([data[16], data[17]]),
            adate: u16::from_le_bytes([data[18], data[19]]),
            begin_hi: u16::from_le_bytes([data[20], data[21]]),
            mtime: u16::from_le_bytes([data[22], data[23]]),
            mdate: u16::from_le_bytes([data[24], data[25]]),
            begin: u16::from_le_bytes([data[26], data[27]]),
            size: u32::from_le_bytes([data[28], data[29], data[30], data[31]]),
        }
    }

    pub fn is_free(&self) -> bool {
        self.name[0] == 0x00
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DELETED_MARKER
    }

    pub fn is_long_name(&self) -> bool {
        self.attr & 0x3F == ATTR_LONG_NAME
    }

    pub fn is_volume_label(&self) -> bool {
        !self.is_long_name() && self.attr & ATTR_VOLUME != 0
    }

    pub fn is_directory(&self) -> bool {
        !self.is_long_name() && self.attr & ATTR_DIRECTORY != 0
    }

    /// True for a slot that names a file or directory (not free, deleted,
    /// a long-name fragment, or the volume label).
    pub fn is_occupied(&self) -> bool {
        !self.is_free() && !self.is_deleted() && !self.is_long_name() && !self.is_volume_label()
    }

    pub fn first_cluster(&self) -> u32 {
        (self.begin_hi as u32) << 16 | self.begin as u32
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.begin = cluster as u16;
        self.begin_hi = (cluster >> 16) as u16;
    }

    pub fn short_name(&self) -> [u8; 11] {
        let mut short = [0u8; 11];
        short[..8].copy_from_slice(&self.name);
        short[8..].copy_from_slice(&self.ext);
        short
    }

    pub fn set_short_name(&mut self, short: &[u8; 11]) {
        self.name.copy_from_slice(&short[..8]);
        self.ext.copy_from_slice(&short[8..]);
    }

    pub fn set_times(&mut self, mtime: SystemTime) {
        let (date, time) = fat_datetime(mtime);
        self.mtime = time;
        self.mdate = date;
        self.ctime = time;
        self.cdate = date;
        self.adate = date;
    }

    /// Host filename for a short name: trimmed, dotted, lowercased.
    pub fn host_name(&self) -> String {
        short_to_host_name(&self.short_name())
    }
}

/// Converts a timestamp to the packed FAT `(date, time)` pair.
pub fn fat_datetime(time: SystemTime) -> (u16, u16) {
    let local: DateTime<Local> = time.into();
    let year = local.year().clamp(1980, 2107) as u16;
    let date = (year - 1980) << 9 | (local.month() as u16) << 5 | local.day() as u16;
    let time = (local.hour() as u16) << 11 | (local.minute() as u16) << 5
        | (local.second() as u16) >> 1;
    (date, time)
}

/// Checksum binding long-name slots to their 8.3 entry.
pub fn lfn_checksum(short: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in short {
        sum = (sum >> 1).wrapping_add((sum & 1) << 7).wrapping_add(byte);
    }
    sum
}

fn translate_short_char(c: char) -> u8 {
    if c.is_ascii_alphanumeric() || (c.is_ascii() && SHORT_NAME_PUNCT.contains(&(c as u8))) {
        c.to_ascii_uppercase() as u8
    } else {
        b'_'
    }
}

/// Derives the 8.3 short name for `filename`, avoiding the names already in
/// `used`. Returns the padded 11-byte name and whether the original name
/// survives only lossily (which calls for long-name slots). "Lossless" means
/// the host name conversion recovers the original, so an all-lowercase name
/// within 8.3 bounds needs no long-name slots.
pub fn derive_short_name(filename: &str, used: &HashSet<[u8; 11]>) -> ([u8; 11], bool) {
    let (base, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos + 1..]),
        _ => (filename, ""),
    };

    let mut short = [b' '; 11];
    let mut base_len = 0;
    for c in base.chars().take(8) {
        short[base_len] = translate_short_char(c);
        base_len += 1;
    }
    // An all-dots or empty stem still needs something in the name field
    if base_len == 0 {
        short[0] = b'_';
        base_len = 1;
    }
    for (i, c) in ext.chars().take(3).enumerate() {
        short[8 + i] = translate_short_char(c);
    }

    let lossy = short_to_host_name(&short) != filename;
    if !used.contains(&short) {
        return (short, lossy);
    }

    // Collision: append ~N to the stem, shrinking it as N grows
    for n in 1u32.. {
        let tail = format!("~{}", n);
        let keep = base_len.min(8 - tail.len());
        let mut candidate = short;
        for (i, slot) in candidate[..8].iter_mut().enumerate() {
            if i >= keep {
                *slot = b' ';
            }
        }
        for (i, byte) in tail.bytes().enumerate() {
            candidate[keep + i] = byte;
        }
        if !used.contains(&candidate) {
            return (candidate, true);
        }
    }
    unreachable!()
}

/// Builds the long-filename slots for `name`, in on-disk order (highest
/// ordinal first, flagged as last). Each slot carries 13 UTF-16 units; the
/// name is NUL-terminated and padded with 0xFFFF.
pub fn create_long_filename(name: &str, checksum: u8) -> Vec<DirEntry> {
    let mut units: Vec<u16> = name.encode_utf16().collect();
    let slots = (units.len() + 12) / 13;
    if units.len() < slots * 13 {
        units.push(0x0000);
    }
    units.resize(slots * 13, 0xFFFF);

    let mut entries = Vec::with_capacity(slots);
    for slot in (0..slots).rev() {
        let chunk = &units[slot * 13..slot * 13 + 13];
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[0] = (slot + 1) as u8 | if slot + 1 == slots { LAST_LONG_ENTRY } else { 0 };
        for (i, unit) in chunk[0..5].iter().enumerate() {
            raw[1 + i * 2..3 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        raw[11] = ATTR_LONG_NAME;
        raw[13] = checksum;
        for (i, unit) in chunk[5..11].iter().enumerate() {
            raw[14 + i * 2..16 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        for (i, unit) in chunk[11..13].iter().enumerate() {
            raw[28 + i * 2..30 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        entries.push(DirEntry::from_bytes(&raw));
    }
    entries
}

/// Reassembles the UTF-16 payload of one long-name slot in chain order.
pub fn long_name_units(entry: &DirEntry) -> Vec<u16> {
    let raw = entry.to_bytes();
    let mut units = Vec::with_capacity(13);
    for i in 0..5 {
        units.push(u16::from_le_bytes([raw[1 + i * 2], raw[2 + i * 2]]));
    }
    for i in 0..6 {
        units.push(u16::from_le_bytes([raw[14 + i * 2], raw[15 + i * 2]]));
    }
    for i in 0..2 {
        units.push(u16::from_le_bytes([raw[28 + i * 2], raw[29 + i * 2]]));
    }
    units
}

pub fn short_to_host_name(short: &[u8; 11]) -> String {
    let base: String = short[..8]
        .iter()
        .take_while(|&&b| b != b' ' && b != 0)
        .map(|&b| (b as char).to_ascii_lowercase())
        .collect();
    let ext: String = short[8..]
        .iter()
        .take_while(|&&b| b != b' ' && b != 0)
        .map(|&b| (b as char).to_ascii_lowercase())
        .collect();
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_to_bytes_layout() {
        let mut entry = DirEntry::default();
        entry.name.copy_from_slice(b"HELLO   ");
        entry.ext.copy_from_slice(b"TXT");
        entry.attr = ATTR_ARCHIVE;
        entry.mtime = 0x5000;
        entry.mdate = 0x4000;
        entry.set_first_cluster(2);
        entry.size = 5;

        let bytes = entry.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[0..8], b"HELLO   ");
        assert_eq!(&bytes[8..11], b"TXT");
        assert_eq!(bytes[11], 0x20); // attr
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 0x5000); // mtime
        assert_eq!(u16::from_le_bytes([bytes[24], bytes[25]]), 0x4000); // mdate
        assert_eq!(u16::from_le_bytes([bytes[26], bytes[27]]), 2); // begin
        assert_eq!(u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]), 5);
    }

    #[test]
    fn test_round_trip_preserves_all_bytes() {
        let mut raw = [0u8; 32];
        for (i, byte) in raw.iter_mut().enumerate() {
            *byte = i as u8 ^ 0xA5;
        }
        assert_eq!(DirEntry::from_bytes(&raw).to_bytes(), raw);
    }

    #[test]
    fn test_first_cluster_spans_begin_hi() {
        let mut entry = DirEntry::default();
        entry.set_first_cluster(0x0003_0002);
        assert_eq!(entry.begin, 0x0002);
        assert_eq!(entry.begin_hi, 0x0003);
        assert_eq!(entry.first_cluster(), 0x0003_0002);
    }

    #[test]
    fn test_derive_short_name_lowercase_round_trips() {
        let used = HashSet::new();
        let (short, lossy) = derive_short_name("hello.txt", &used);
        assert_eq!(&short, b"HELLO   TXT");
        assert!(!lossy);
    }

    #[test]
    fn test_derive_short_name_case_needs_long_name() {
        let used = HashSet::new();
        let (short, lossy) = derive_short_name("Hello.txt", &used);
        assert_eq!(&short, b"HELLO   TXT");
        assert!(lossy);

        let (short, lossy) = derive_short_name("HELLO.TXT", &used);
        assert_eq!(&short, b"HELLO   TXT");
        assert!(lossy);
    }

    #[test]
    fn test_derive_short_name_truncates_and_translates() {
        let used = HashSet::new();
        let (short, lossy) = derive_short_name("long name here.html", &used);
        assert_eq!(&short[..8], b"LONG_NAM");
        assert_eq!(&short[8..], b"HTM");
        assert!(lossy);
    }

    #[test]
    fn test_derive_short_name_collisions_get_numeric_tails() {
        let mut used = HashSet::new();
        let (first, _) = derive_short_name("document1.txt", &used);
        used.insert(first);
        let (second, lossy) = derive_short_name("document2.txt", &used);
        assert!(lossy);
        assert_eq!(&second[..8], b"DOCUME~1");
        used.insert(second);
        let (third, _) = derive_short_name("document3.txt", &used);
        assert_eq!(&third[..8], b"DOCUME~2");
        assert_ne!(first, second);
        assert_ne!(second, third);
    }

    #[test]
    fn test_lfn_checksum_reference_value() {
        // Value computed with the canonical VFAT rotate-and-add
        let mut sum: u32 = 0;
        for &b in b"HELLO   TXT" {
            sum = (((sum & 1) << 7) + (sum >> 1) + b as u32) & 0xFF;
        }
        assert_eq!(lfn_checksum(b"HELLO   TXT"), sum as u8);
    }

    #[test]
    fn test_create_long_filename_slots() {
        let checksum = lfn_checksum(b"LONG_N~1TXT");
        let entries = create_long_filename("long name indeed.txt", checksum);

        // 20 chars -> 2 slots, stored highest ordinal first
        assert_eq!(entries.len(), 2);
        let first = entries[0].to_bytes();
        let second = entries[1].to_bytes();
        assert_eq!(first[0], 0x42); // ordinal 2 | LAST_LONG_ENTRY
        assert_eq!(second[0], 0x01);
        assert_eq!(first[11], ATTR_LONG_NAME);
        assert_eq!(first[13], checksum);
        assert_eq!(second[13], checksum);

        // Second slot (ordinal 1) carries the first 13 characters
        let units = long_name_units(&entries[1]);
        let text: String = char::decode_utf16(units.into_iter())
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(&text, "long name ind");

        // Terminator then 0xFFFF padding in the last chunk
        let units = long_name_units(&entries[0]);
        assert_eq!(&units[..7], "eed.txt".encode_utf16().collect::<Vec<_>>().as_slice());
        assert_eq!(units[7], 0x0000);
        assert!(units[8..].iter().all(|&u| u == 0xFFFF));
    }

    #[test]
    fn test_fat_datetime_packing() {
        // 2026-08-01 12:30:40 local
        let local = chrono::Local.with_ymd_and_hms(2026, 8, 1, 12, 30, 40).unwrap();
        let system: SystemTime =
            SystemTime::UNIX_EPOCH + Duration::from_secs(local.timestamp() as u64);
        let (date, time) = fat_datetime(system);
        assert_eq!(date >> 9, 2026 - 1980);
        assert_eq!((date >> 5) & 0x0F, 8);
        assert_eq!(date & 0x1F, 1);
        assert_eq!(time >> 11, 12);
        assert_eq!((time >> 5) & 0x3F, 30);
        assert_eq!(time & 0x1F, 20); // two-second granularity
    }

    #[test]
    fn test_host_name_from_short() {
        assert_eq!(short_to_host_name(b"HELLO   TXT"), "hello.txt");
        assert_eq!(short_to_host_name(b"NOEXT      "), "noext");
    }
}
