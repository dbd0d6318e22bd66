/*
 * NBD Attach Loop
 * ===============
 *
 * Userspace side of the kernel NBD client. One end of a socketpair is
 * handed to the kernel (NBD_SET_SOCK + NBD_DO_IT on a helper thread); the
 * other end receives block requests which are dispatched into the virtual
 * image:
 *
 *   READ/WRITE  -> seek + read/write on the image
 *   FLUSH       -> commit_changes (write-back to the host tree)
 *   TRIM        -> acknowledged, nothing to discard
 *   DISC        -> ends the serve loop
 *
 * The request stream is strictly sequential; the image is driven from this
 * thread only.
 */

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::vfat::VfatImage;

// From <linux/nbd.h>
const NBD_SET_BLKSIZE: libc::c_ulong = 0xAB01;
const NBD_DO_IT: libc::c_ulong = 0xAB03;
const NBD_CLEAR_SOCK: libc::c_ulong = 0xAB04;
const NBD_CLEAR_QUE: libc::c_ulong = 0xAB05;
const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xAB07;
const NBD_SET_SOCK: libc::c_ulong = 0xAB00;

const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

const NBD_CMD_READ: u32 = 0;
const NBD_CMD_WRITE: u32 = 1;
const NBD_CMD_DISC: u32 = 2;
const NBD_CMD_FLUSH: u32 = 3;
const NBD_CMD_TRIM: u32 = 4;

/// Kernel requests never exceed the device's max_sectors; anything larger
/// means a corrupt stream.
const MAX_REQUEST_BYTES: u32 = 64 * 1024 * 1024;

struct Request {
    cmd: u32,
    handle: [u8; 8],
    from: u64,
    len: u32,
}

fn ioctl(fd: RawFd, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, request, arg) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn read_request(sock: &mut UnixStream) -> io::Result<Request> {
    let mut raw = [0u8; 28];
    sock.read_exact(&mut raw)?;
    let magic = u32::from_be_bytes(raw[0..4].try_into().unwrap());
    if magic != NBD_REQUEST_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad request magic {:#010x}", magic),
        ));
    }
    let mut handle = [0u8; 8];
    handle.copy_from_slice(&raw[8..16]);
    Ok(Request {
        cmd: u32::from_be_bytes(raw[4..8].try_into().unwrap()),
        handle,
        from: u64::from_be_bytes(raw[16..24].try_into().unwrap()),
        len: u32::from_be_bytes(raw[24..28].try_into().unwrap()),
    })
}

fn send_reply(
    sock: &mut UnixStream,
    handle: &[u8; 8],
    error: u32,
    data: Option<&[u8]>,
) -> io::Result<()> {
    let mut reply = [0u8; 16];
    reply[0..4].copy_from_slice(&NBD_REPLY_MAGIC.to_be_bytes());
    reply[4..8].copy_from_slice(&error.to_be_bytes());
    reply[8..16].copy_from_slice(handle);
    sock.write_all(&reply)?;
    if let Some(data) = data {
        sock.write_all(data)?;
    }
    Ok(())
}

/// Attaches `image` to the NBD device node and serves requests until the
/// client disconnects.
pub fn serve(device: &Path, image: &mut VfatImage) -> Result<()> {
    let size = image.size();
    let (kernel_sock, mut sock) = UnixStream::pair().context("socketpair")?;
    let dev = File::options()
        .read(true)
        .write(true)
        .open(device)
        .with_context(|| format!("open {}", device.display()))?;

    let dev_fd = dev.as_raw_fd();
    ioctl(dev_fd, NBD_SET_BLKSIZE, 512).context("NBD_SET_BLKSIZE")?;
    ioctl(dev_fd, NBD_SET_SIZE_BLOCKS, (size / 512) as libc::c_ulong)
        .context("NBD_SET_SIZE_BLOCKS")?;
    ioctl(dev_fd, NBD_CLEAR_SOCK, 0).context("NBD_CLEAR_SOCK")?;

    // NBD_DO_IT blocks until disconnect, so it gets its own thread; the
    // device fd and the kernel end of the socketpair move with it
    let device_name = device.display().to_string();
    let pump = thread::spawn(move || {
        let fd = dev.as_raw_fd();
        if let Err(err) = ioctl(fd, NBD_SET_SOCK, kernel_sock.as_raw_fd() as libc::c_ulong) {
            error!("NBD_SET_SOCK on {}: {}", device_name, err);
            return;
        }
        info!("attached to {}", device_name);
        if let Err(err) = ioctl(fd, NBD_DO_IT, 0) {
            warn!("{} detached: {}", device_name, err);
        }
        let _ = ioctl(fd, NBD_CLEAR_QUE, 0);
        let _ = ioctl(fd, NBD_CLEAR_SOCK, 0);
    });

    let mut disconnect = false;
    while !disconnect {
        let request = match read_request(&mut sock) {
            Ok(request) => request,
            Err(err) => {
                warn!("request stream ended: {}", err);
                break;
            }
        };
        if request.len > MAX_REQUEST_BYTES {
            warn!("oversized request ({} bytes), disconnecting", request.len);
            break;
        }

        match request.cmd {
            NBD_CMD_READ => {
                debug!("R - {}, {}", request.from, request.len);
                let mut data = vec![0u8; request.len as usize];
                let result = image
                    .seek(SeekFrom::Start(request.from))
                    .and_then(|_| image.read_exact(&mut data));
                match result {
                    Ok(()) => send_reply(&mut sock, &request.handle, 0, Some(&data))?,
                    Err(err) => {
                        error!("read failed: {}", err);
                        send_reply(&mut sock, &request.handle, libc::EIO as u32, None)?;
                    }
                }
            }
            NBD_CMD_WRITE => {
                debug!("W - {}, {}", request.from, request.len);
                let mut data = vec![0u8; request.len as usize];
                sock.read_exact(&mut data).context("read write payload")?;
                let result = image
                    .seek(SeekFrom::Start(request.from))
                    .and_then(|_| image.write_all(&data));
                match result {
                    Ok(()) => send_reply(&mut sock, &request.handle, 0, None)?,
                    Err(err) => {
                        error!("write failed: {}", err);
                        send_reply(&mut sock, &request.handle, libc::EIO as u32, None)?;
                    }
                }
            }
            NBD_CMD_FLUSH => {
                info!("flush requested");
                match image.commit_changes() {
                    Ok(()) => send_reply(&mut sock, &request.handle, 0, None)?,
                    Err(err) => {
                        error!("commit failed: {}", err);
                        send_reply(&mut sock, &request.handle, libc::EIO as u32, None)?;
                    }
                }
            }
            NBD_CMD_TRIM => {
                debug!("T - {}, {}", request.from, request.len);
                send_reply(&mut sock, &request.handle, 0, None)?;
            }
            NBD_CMD_DISC => {
                info!("disconnect requested");
                disconnect = true;
            }
            other => {
                warn!("unsupported command {}", other);
                send_reply(&mut sock, &request.handle, libc::EINVAL as u32, None)?;
            }
        }
    }

    drop(sock);
    let _ = pump.join();
    Ok(())
}
