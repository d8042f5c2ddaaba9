//! Device I/O control dispatch.
//!
//! Control codes pack a device family, an access mask, a function number and a
//! buffering method into one 32-bit value. Dispatch is by family: a local
//! family handler gets the first shot and may answer trivial codes itself;
//! everything it does not claim, wrong-class handles included, falls through
//! to the coordination service exactly once. The service's answer is final,
//! whatever it is.

use crate::aio::{AioCallback, AioKind};
use crate::config::Config;
use crate::handle::FileHandle;
use crate::server::protocol::RequestBody;
use crate::server::ServerClient;
use crate::status::{IoStatusBlock, NtStatus};
use crate::volume::{self, DeviceType};
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Buffering methods, the low two bits of a control code.
pub const METHOD_BUFFERED: u32 = 0;
pub const METHOD_IN_DIRECT: u32 = 1;
pub const METHOD_OUT_DIRECT: u32 = 2;
pub const METHOD_NEITHER: u32 = 3;

/// A packed device control code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlCode(pub u32);

impl ControlCode {
    pub const fn new(device: u32, function: u32, method: u32, access: u32) -> ControlCode {
        ControlCode((device << 16) | (access << 14) | (function << 2) | method)
    }

    pub fn device(self) -> u32 {
        self.0 >> 16
    }

    pub fn access(self) -> u32 {
        (self.0 >> 14) & 0x3
    }

    pub fn function(self) -> u32 {
        (self.0 >> 2) & 0xfff
    }

    pub fn method(self) -> u32 {
        self.0 & 0x3
    }
}

impl fmt::Debug for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ControlCode({:#010x}: device={:#x} access={} function={:#x} method={})",
            self.0,
            self.device(),
            self.access(),
            self.function(),
            self.method()
        )
    }
}

// Device families.
const DEVICE_CD_ROM: u32 = 0x02;
const DEVICE_CONTROLLER: u32 = 0x04;
const DEVICE_DISK: u32 = 0x07;
const DEVICE_SERIAL: u32 = 0x1b;
const DEVICE_TAPE: u32 = 0x1f;
const DEVICE_MASS_STORAGE: u32 = 0x2d;
const DEVICE_DVD: u32 = 0x33;

/// Fixed-disk geometry query, answered locally.
pub const IOCTL_DISK_GET_DRIVE_GEOMETRY: ControlCode =
    ControlCode::new(DEVICE_DISK, 0x0000, METHOD_BUFFERED, 0);

/// Media-presence probe, answered locally for mounted volumes.
pub const IOCTL_STORAGE_CHECK_VERIFY: ControlCode =
    ControlCode::new(DEVICE_MASS_STORAGE, 0x0200, METHOD_BUFFERED, 1);

/// Issue a device control operation.
///
/// `output` receives the reply payload when the operation completes within the
/// call; a deferred completion delivers its payload through `callback` instead
/// and leaves `output` untouched.
pub async fn device_io_control(
    client: &ServerClient,
    config: &Config,
    handle: &FileHandle,
    iosb: Arc<IoStatusBlock>,
    code: ControlCode,
    input: &[u8],
    output: &mut [u8],
    callback: Option<AioCallback>,
) -> NtStatus {
    let (status, information) = match local_family_handler(config, handle, code, output) {
        Some(answer) => answer,
        None => {
            return server_ioctl(client, handle, iosb, code, input, output, callback).await;
        }
    };
    iosb.set(status, information);
    if let Some(cb) = callback {
        cb(status, Bytes::copy_from_slice(&output[..information]));
    }
    status
}

/// First-shot dispatch by device family. `None` means the family handler does
/// not claim the code and the generic path runs; a device-class mismatch also
/// falls through, since the service gets to judge the handle for itself.
fn local_family_handler(
    config: &Config,
    handle: &FileHandle,
    code: ControlCode,
    output: &mut [u8],
) -> Option<(NtStatus, usize)> {
    match code.device() {
        DEVICE_DISK | DEVICE_CD_ROM | DEVICE_CONTROLLER | DEVICE_MASS_STORAGE | DEVICE_DVD => {
            storage_ioctl(config, handle, code, output)
        }
        DEVICE_SERIAL => {
            class_mismatch_log(config, handle, DeviceType::SerialPort);
            None
        }
        DEVICE_TAPE => {
            class_mismatch_log(config, handle, DeviceType::Tape);
            None
        }
        _ => None,
    }
}

fn class_mismatch_log(config: &Config, handle: &FileHandle, expected: DeviceType) {
    let Some(fd) = handle.unix_fd() else { return };
    if let Ok(info) = volume::classify_fd(fd, &config.fs_magic_overrides) {
        if info.device_type != expected {
            debug!(?info.device_type, ?expected, "control code for another device class");
        }
    }
}

fn storage_ioctl(
    config: &Config,
    handle: &FileHandle,
    code: ControlCode,
    output: &mut [u8],
) -> Option<(NtStatus, usize)> {
    let fd = handle.unix_fd()?;
    let info = volume::classify_fd(fd, &config.fs_magic_overrides).ok()?;
    if !matches!(
        info.device_type,
        DeviceType::Disk
            | DeviceType::Cdrom
            | DeviceType::CdromFileSystem
            | DeviceType::DiskFileSystem
            | DeviceType::VirtualDisk
    ) {
        debug!(?info.device_type, "storage control code on a non-storage handle");
        return None;
    }

    if code == IOCTL_STORAGE_CHECK_VERIFY {
        // The descriptor is open and stat'able, so media is present.
        return Some((NtStatus::SUCCESS, 0));
    }
    if code == IOCTL_DISK_GET_DRIVE_GEOMETRY {
        return Some(drive_geometry(fd, info.device_type, output));
    }
    None
}

/// Synthesize a drive geometry record from the descriptor's size: fake but
/// self-consistent 255/63 head and sector counts, 2048-byte sectors on optical
/// media.
fn drive_geometry(
    fd: std::os::fd::RawFd,
    device_type: DeviceType,
    output: &mut [u8],
) -> (NtStatus, usize) {
    const GEOMETRY_LEN: usize = 24;
    const MEDIA_REMOVABLE: u32 = 11;
    const MEDIA_FIXED: u32 = 12;

    if output.len() < GEOMETRY_LEN {
        return (NtStatus::BUFFER_TOO_SMALL, 0);
    }
    let size = match nix::sys::stat::fstat(fd) {
        Ok(st) => st.st_size.max(0) as u64,
        Err(err) => return (NtStatus::from_errno(err), 0),
    };
    let (bytes_per_sector, media) = match device_type {
        DeviceType::Cdrom | DeviceType::CdromFileSystem => (2048u32, MEDIA_REMOVABLE),
        _ => (512u32, MEDIA_FIXED),
    };
    let tracks_per_cylinder = 255u32;
    let sectors_per_track = 63u32;
    let cylinder_bytes = bytes_per_sector as u64 * sectors_per_track as u64 * tracks_per_cylinder as u64;
    let cylinders = (size / cylinder_bytes.max(1)).max(1) as i64;

    output[..8].copy_from_slice(&cylinders.to_le_bytes());
    output[8..12].copy_from_slice(&media.to_le_bytes());
    output[12..16].copy_from_slice(&tracks_per_cylinder.to_le_bytes());
    output[16..20].copy_from_slice(&sectors_per_track.to_le_bytes());
    output[20..24].copy_from_slice(&bytes_per_sector.to_le_bytes());
    (NtStatus::SUCCESS, GEOMETRY_LEN)
}

/// Generic service path for control codes no local handler claims. Runs at
/// most once per operation.
pub(crate) async fn server_ioctl(
    client: &ServerClient,
    handle: &FileHandle,
    iosb: Arc<IoStatusBlock>,
    code: ControlCode,
    input: &[u8],
    output: &mut [u8],
    callback: Option<AioCallback>,
) -> NtStatus {
    // Payload delivered by a deferred completion, claimed after the wait.
    let deferred: Arc<Mutex<Option<Bytes>>> = Arc::new(Mutex::new(None));
    let slot = deferred.clone();
    let wrapped: AioCallback = Box::new(move |status, payload| {
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(payload.clone());
        if let Some(cb) = callback {
            cb(status, payload);
        }
    });
    let io = match client.pool().acquire(
        AioKind::Irp {
            buffer: vec![0; output.len()],
        },
        wrapped,
        handle.server_id(),
        iosb.clone(),
    ) {
        Ok(io) => io,
        Err(status) => return status,
    };

    // Non-buffered methods hand the current output contents to the service as
    // well, appended after the input segment.
    let mut request = Vec::with_capacity(
        input.len() + if code.method() != METHOD_BUFFERED { output.len() } else { 0 },
    );
    request.extend_from_slice(input);
    if code.method() != METHOD_BUFFERED {
        request.extend_from_slice(output);
    }

    let reply = client
        .call_async(
            handle.server_id(),
            RequestBody::Ioctl { code: code.0 },
            &request,
            output.len(),
            io,
        )
        .await;

    let mut status = reply.status;
    if status.is_terminal() {
        let n = reply.data.len().min(output.len());
        output[..n].copy_from_slice(&reply.data[..n]);
    } else if let Some(wait) = reply.wait {
        status = client.wait_async(wait, false, &iosb).await;
        if let Some(payload) = deferred
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let n = payload.len().min(output.len());
            output[..n].copy_from_slice(&payload[..n]);
        }
    }

    if status == NtStatus::NOT_SUPPORTED {
        warn!(code = ?code, "unsupported control code");
    }
    status
}
