//! Mount-manager endpoint queries.
//!
//! Volume facts that have no unix-side source (labels, serial numbers, the
//! exact filesystem kind) come from the coordination service's mount manager.
//! Replies are variable-sized; the first attempt uses a fixed buffer and a
//! `BUFFER_OVERFLOW` answer is retried exactly once at the advertised size.

use crate::config::Config;
use crate::handle::FileHandle;
use crate::server::ServerClient;
use crate::server::protocol::{RequestBody, UnixDriveInfo};
use crate::status::NtStatus;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// First-attempt reply capacity for mount-manager queries.
const INITIAL_REPLY_CAP: usize = 1024;

/// Resolve a unix path to the virtual drive root containing it.
pub fn find_drive_root(config: &Config, path: &Path) -> Option<char> {
    config
        .drive_roots
        .iter()
        .find(|drive| path.starts_with(&drive.root))
        .map(|drive| drive.letter)
}

/// Ask the service for the unix path backing a handle. The needed size is not
/// known up front, so a `BUFFER_OVERFLOW` reply regrows to the advertised size
/// and retries until the path fits.
pub async fn get_handle_unix_name(
    client: &ServerClient,
    handle: u64,
) -> Result<PathBuf, NtStatus> {
    let mut cap = 256usize;
    loop {
        let reply = client
            .call(handle, RequestBody::GetHandleUnixName, &[], cap)
            .await;
        match reply.status {
            NtStatus::SUCCESS => {
                let bytes = reply.data.to_vec();
                let s = String::from_utf8(bytes).map_err(|_| {
                    warn!(handle, "non-utf8 unix path from service");
                    NtStatus::UNSUCCESSFUL
                })?;
                return Ok(PathBuf::from(s));
            }
            NtStatus::BUFFER_OVERFLOW => {
                debug_assert!(reply.size_hint > cap);
                cap = reply.size_hint.max(cap + 1);
            }
            status => return Err(status),
        }
    }
}

/// Query volume facts for a drive letter or raw device. One regrow retry; a
/// second overflow is a service bug and fails the query.
pub async fn query_unix_drive(
    client: &ServerClient,
    handle: u64,
    letter: Option<char>,
    unix_dev: u64,
) -> Result<UnixDriveInfo, NtStatus> {
    let body = RequestBody::QueryUnixDrive {
        letter: letter.map(|c| c as u8).unwrap_or(0),
        unix_dev,
    };
    let mut reply = client
        .call(handle, body.clone(), &[], INITIAL_REPLY_CAP)
        .await;
    if reply.status == NtStatus::BUFFER_OVERFLOW {
        let cap = reply.size_hint.max(INITIAL_REPLY_CAP);
        debug!(cap, "mount-manager reply overflow, retrying once");
        reply = client.call(handle, body, &[], cap).await;
        if reply.status == NtStatus::BUFFER_OVERFLOW {
            warn!("mount-manager reply overflowed its own advertised size");
            return Err(NtStatus::UNSUCCESSFUL);
        }
    }
    if reply.status.is_error() {
        return Err(reply.status);
    }
    bincode::deserialize(&reply.data).map_err(|err| {
        warn!(error = %err, "malformed mount-manager reply");
        NtStatus::UNSUCCESSFUL
    })
}

/// Full mount-manager lookup for a handle: resolve its unix path, map that to
/// a configured drive root, then query the drive.
pub async fn query_fs_info(
    client: &ServerClient,
    config: &Config,
    handle: &FileHandle,
) -> Result<UnixDriveInfo, NtStatus> {
    let path = get_handle_unix_name(client, handle.server_id()).await?;
    let letter = find_drive_root(config, &path);
    let unix_dev = match handle.unix_fd() {
        Some(fd) => nix::sys::stat::fstat(fd)
            .map(|st| st.st_dev)
            .map_err(NtStatus::from_errno)?,
        None => 0,
    };
    query_unix_drive(client, handle.server_id(), letter, unix_dev).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveRoot;

    #[test]
    fn drive_root_resolution_prefers_first_match() {
        let mut config = Config::default();
        config.drive_roots = vec![
            DriveRoot {
                letter: 'c',
                root: PathBuf::from("/srv/drive_c"),
            },
            DriveRoot {
                letter: 'd',
                root: PathBuf::from("/mnt/data"),
            },
        ];
        assert_eq!(
            find_drive_root(&config, Path::new("/srv/drive_c/users/file.txt")),
            Some('c')
        );
        assert_eq!(find_drive_root(&config, Path::new("/mnt/data")), Some('d'));
        assert_eq!(find_drive_root(&config, Path::new("/tmp/x")), None);
    }
}
