/*
 * fatmirror Library
 * =================
 *
 * Exposes a host directory as a virtual FAT12/16 block device.
 *
 * Components:
 * ----------
 * - Virtual FAT engine (layout, scan, serve, write-back)
 * - Redo-log block store (out-of-place write capture)
 * - NBD device glue
 * - Configuration loading
 */

pub mod config;
pub mod nbd;
pub mod redolog;
pub mod vfat;

// Re-export commonly used types
pub use config::Settings;
pub use redolog::{Redolog, RedologSubtype};
pub use vfat::{ImageError, ImageOptions, RedologMode, VfatImage};
