use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use fatmirror::redolog::{RedologHeader, REDOLOG_PAGE_NOT_ALLOCATED, STANDARD_HEADER_SIZE};
use fatmirror::vfat::{ImageOptions, RedologMode, VfatImage};

#[derive(Parser)]
#[command(name = "fatdump")]
#[command(about = "Inspect fatmirror images and redo-logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the virtual FAT image of a directory into a flat disk file
    Dump {
        /// Directory to mirror
        host_dir: PathBuf,
        /// Output image file
        output: PathBuf,
        /// Disk size in MiB
        #[arg(long, default_value_t = 128)]
        size: u64,
    },
    /// Print the header and usage of a redo-log file
    Info {
        /// Redo-log file
        redolog: PathBuf,
    },
}

fn dump(host_dir: &PathBuf, output: &PathBuf, size_mb: u64) -> Result<()> {
    let options = ImageOptions {
        size: size_mb * 1024 * 1024,
        redolog: RedologMode::Disabled,
    };
    let mut image = VfatImage::open(host_dir, options)
        .with_context(|| format!("open {}", host_dir.display()))?;
    let mut out = File::create(output).with_context(|| format!("create {}", output.display()))?;

    image.seek(SeekFrom::Start(0))?;
    let total = io::copy(&mut image, &mut out).context("copy image")?;
    out.flush()?;
    println!("wrote {} bytes to {}", total, output.display());
    image.close()?;
    Ok(())
}

fn info(redolog: &PathBuf) -> Result<()> {
    let mut file = File::open(redolog).with_context(|| format!("open {}", redolog.display()))?;
    let mut raw = [0u8; STANDARD_HEADER_SIZE as usize];
    file.read_exact(&mut raw).context("read header")?;
    let header = match RedologHeader::from_bytes(&raw) {
        Ok(header) => header,
        Err(code) => bail!("not a redo-log (check code {})", code),
    };

    let mut catalog = vec![0u8; header.catalog as usize * 4];
    file.read_exact(&mut catalog).context("read catalog")?;
    let allocated = catalog
        .chunks_exact(4)
        .filter(|c| u32::from_le_bytes((*c).try_into().unwrap()) != REDOLOG_PAGE_NOT_ALLOCATED)
        .count();

    println!("subtype:         {}", header.subtype.as_str());
    println!("version:         {:#010x}", header.version);
    println!("disk size:       {} bytes", header.disk);
    println!("catalog entries: {}", header.catalog);
    println!("extent size:     {} bytes", header.extent);
    println!("bitmap size:     {} bytes", header.bitmap);
    println!("extents in use:  {}", allocated);
    if header.timestamp != 0 {
        println!("timestamp:       {:#010x}", header.timestamp);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Dump {
            host_dir,
            output,
            size,
        } => dump(host_dir, output, *size),
        Commands::Info { redolog } => info(redolog),
    }
}
