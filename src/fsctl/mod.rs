//! Filesystem control dispatch.
//!
//! Filesystem control codes share the packed layout of device control codes
//! but address the mounted filesystem rather than the device. A handful are
//! answered locally (some as deliberate stubs, kept for compatibility);
//! everything else takes the same generic service path as device controls.

use crate::aio::AioCallback;
use crate::handle::FileHandle;
use crate::ioctl::{self, ControlCode};
use crate::server::ServerClient;
use crate::status::{IoStatusBlock, NtStatus};
use crate::volume::mountmgr;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

pub const FSCTL_LOCK_VOLUME: ControlCode = ControlCode(0x0009_0018);
pub const FSCTL_UNLOCK_VOLUME: ControlCode = ControlCode(0x0009_001c);
pub const FSCTL_DISMOUNT_VOLUME: ControlCode = ControlCode(0x0009_0020);
pub const FSCTL_IS_VOLUME_MOUNTED: ControlCode = ControlCode(0x0009_0028);
pub const FSCTL_GET_RETRIEVAL_POINTERS: ControlCode = ControlCode(0x0009_0073);
pub const FSCTL_SET_SPARSE: ControlCode = ControlCode(0x0009_00c4);
pub const FSCTL_PIPE_IMPERSONATE: ControlCode = ControlCode(0x0011_001c);

/// Fabricated retrieval-pointers record: one extent starting at virtual
/// cluster zero. 32 bytes: extent count, pad, starting vcn, next vcn, lcn.
const RETRIEVAL_POINTERS_LEN: usize = 32;

/// Issue a filesystem control operation. Same calling convention as
/// [`crate::ioctl::device_io_control`].
pub async fn fs_control(
    client: &ServerClient,
    handle: &FileHandle,
    iosb: Arc<IoStatusBlock>,
    code: ControlCode,
    input: &[u8],
    output: &mut [u8],
    callback: Option<AioCallback>,
) -> NtStatus {
    let (status, information) = match code {
        FSCTL_DISMOUNT_VOLUME => {
            let status =
                ioctl::server_ioctl(client, handle, iosb.clone(), code, input, output, callback)
                    .await;
            if status.is_success() {
                unmount_volume(client, handle).await;
            }
            return status;
        }
        FSCTL_PIPE_IMPERSONATE => {
            warn!("pipe impersonation requested, impersonating self");
            (NtStatus::SUCCESS, 0)
        }
        // Volume lock state is not tracked; report success so callers that
        // lock around maintenance operations keep working.
        FSCTL_LOCK_VOLUME | FSCTL_UNLOCK_VOLUME | FSCTL_IS_VOLUME_MOUNTED => {
            (NtStatus::SUCCESS, 0)
        }
        FSCTL_GET_RETRIEVAL_POINTERS => retrieval_pointers(output),
        FSCTL_SET_SPARSE => {
            // Files are sparse whenever the filesystem decides they are;
            // accept the request and do nothing.
            debug!(handle = handle.server_id(), "ignoring sparse attribute change");
            (NtStatus::SUCCESS, 0)
        }
        _ => {
            return ioctl::server_ioctl(client, handle, iosb, code, input, output, callback).await;
        }
    };

    iosb.set(status, information);
    if let Some(cb) = callback {
        cb(status, Bytes::copy_from_slice(&output[..information]));
    }
    status
}

/// There is no per-file cluster map to report, so fabricate the one answer
/// every caller of this code can cope with: a single contiguous extent.
fn retrieval_pointers(output: &mut [u8]) -> (NtStatus, usize) {
    if output.len() < RETRIEVAL_POINTERS_LEN {
        return (NtStatus::BUFFER_TOO_SMALL, 0);
    }
    output[..4].copy_from_slice(&1u32.to_le_bytes()); // extent count
    output[4..8].copy_from_slice(&0u32.to_le_bytes()); // pad
    output[8..16].copy_from_slice(&1i64.to_le_bytes()); // starting vcn
    output[16..24].copy_from_slice(&0i64.to_le_bytes()); // next vcn
    output[24..32].copy_from_slice(&0i64.to_le_bytes()); // lcn
    (NtStatus::SUCCESS, RETRIEVAL_POINTERS_LEN)
}

/// Best-effort local unmount after a successful dismount: resolve the mount
/// point through the service and detach it. Failure only logs; the service
/// already considers the volume dismounted.
async fn unmount_volume(client: &ServerClient, handle: &FileHandle) {
    let path = match mountmgr::get_handle_unix_name(client, handle.server_id()).await {
        Ok(path) => path,
        Err(status) => {
            debug!(?status, "cannot resolve mount point for dismounted volume");
            return;
        }
    };
    if let Err(err) = nix::mount::umount(&path) {
        debug!(path = %path.display(), errno = err as i32, "local unmount failed");
    }
}
