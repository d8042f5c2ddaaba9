//! Resource handles.

use std::os::fd::RawFd;

/// Opaque reference to an open file-like object (file, directory, device,
/// pipe, volume). Owned by the caller; the translation layer never retains it
/// beyond a single call.
///
/// `server_id` names the object inside the coordination service; `fd` is the
/// underlying unix descriptor when the object is backed by one (pure server
/// objects such as unopened volumes have none).
#[derive(Clone, Debug)]
pub struct FileHandle {
    server_id: u64,
    fd: Option<RawFd>,
}

impl FileHandle {
    pub fn new(server_id: u64, fd: Option<RawFd>) -> Self {
        Self { server_id, fd }
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    pub fn unix_fd(&self) -> Option<RawFd> {
        self.fd
    }
}
