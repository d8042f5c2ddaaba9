//! Crate-wide configuration.
//!
//! Everything here has a sensible default so the translation layer can be
//! constructed without any external configuration; callers embedding the crate
//! override fields as needed.

use std::path::PathBuf;
use std::time::Duration;

/// A virtual-drive root: a directory subtree presented to callers as a drive.
/// Volume classification resolves unix paths against these roots before asking
/// the mount-manager endpoint for details.
#[derive(Clone, Debug)]
pub struct DriveRoot {
    pub letter: char,
    pub root: PathBuf,
}

/// Extra filesystem-magic classifications merged over the built-in table.
/// The built-in set is heuristic and platform-dependent, so it is extensible
/// rather than exhaustive.
#[derive(Clone, Debug)]
pub struct FsMagicOverride {
    pub magic: i64,
    pub kind: crate::volume::FsCategory,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Unix socket of the coordination service.
    pub server_socket: PathBuf,
    /// Virtual-drive roots, checked in order.
    pub drive_roots: Vec<DriveRoot>,
    /// Extra statfs-magic to category mappings.
    pub fs_magic_overrides: Vec<FsMagicOverride>,
    /// Sleep between lock retries when the conflict is held by a
    /// non-cooperating process and no wake signal exists.
    pub lock_retry_interval: Duration,
    /// Minimum raw-event ring size for a directory watch.
    pub notify_min_buffer: usize,
    /// Upper bound on concurrently outstanding completion objects.
    pub max_outstanding_io: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_socket: PathBuf::from("/run/ntio/server.sock"),
            drive_roots: Vec::new(),
            fs_magic_overrides: Vec::new(),
            lock_retry_interval: Duration::from_millis(100),
            notify_min_buffer: 4096,
            max_outstanding_io: 4096,
        }
    }
}
