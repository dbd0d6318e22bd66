/*
 * fatmirror Entry Point
 * =====================
 *
 * Bootstraps the virtual image and hands it to the NBD loop:
 *
 * 1. Parse arguments (and the optional TOML config file).
 * 2. Build the virtual FAT image over the host directory.
 * 3. Attach it to the NBD device and serve until disconnect.
 * 4. Tear the image down; a volatile redo-log disappears with it.
 *
 * Exit code 0 on a clean shutdown, 1 on argument or open failure.
 */

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};

use fatmirror::config::Settings;
use fatmirror::vfat::{ImageOptions, VfatImage};

#[derive(Parser)]
#[command(name = "fatmirror")]
#[command(about = "Serve a host directory as a FAT disk over NBD", long_about = None)]
struct Cli {
    /// NBD device node, e.g. /dev/nbd0 (load the nbd module first)
    nbd_device: PathBuf,

    /// Host directory to expose
    host_dir: PathBuf,

    /// Virtual disk size in MiB
    #[arg(long)]
    size: Option<u64>,

    /// Keep guest writes in a persistent redo-log at this path
    #[arg(long)]
    redolog: Option<PathBuf>,

    /// TOML config file (size_mb, redolog, subtype)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref(), cli.size, cli.redolog)?;
    let options = ImageOptions {
        size: settings.size,
        redolog: settings.redolog,
    };

    let mut image = VfatImage::open(&cli.host_dir, options)
        .with_context(|| format!("failed to open directory {}", cli.host_dir.display()))?;

    let served = fatmirror::nbd::serve(&cli.nbd_device, &mut image);
    image.close().context("tear down image")?;
    served
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = TermLogger::init(
        level,
        LogConfig::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );

    if let Err(err) = run(cli) {
        eprintln!("fatmirror: {:#}", err);
        process::exit(1);
    }
}
