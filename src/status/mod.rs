//! Native status vocabulary and the errno translation table.
//!
//! Every operation in this crate reports an [`NtStatus`]: zero for success,
//! high-bit-set values for failures, and a small set of informational codes
//! (`PENDING`, `ALERTED`, `NOTIFY_ENUM_DIR`). Codes travel over the wire as raw
//! `i32`, so the type stays an open-ended newtype rather than a closed enum.

use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// A native status code. `0` means success; negative (high-bit-set) values are
/// failures; `PENDING` means "in progress, consult the I/O status block later".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NtStatus(pub i32);

macro_rules! status_codes {
    ($( $name:ident = $value:expr; )*) => {
        impl NtStatus {
            $( pub const $name: NtStatus = NtStatus($value as u32 as i32); )*
        }

        impl fmt::Debug for NtStatus {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $( NtStatus::$name => f.write_str(stringify!($name)), )*
                    NtStatus(other) => write!(f, "NtStatus({:#010x})", other as u32),
                }
            }
        }
    };
}

status_codes! {
    SUCCESS                    = 0x0000_0000u32;
    ALERTED                    = 0x0000_0101u32;
    PENDING                    = 0x0000_0103u32;
    NOTIFY_ENUM_DIR            = 0x0000_010Cu32;
    BUFFER_OVERFLOW            = 0x8000_0005u32;
    DEVICE_BUSY                = 0x8000_0011u32;
    UNSUCCESSFUL               = 0xC000_0001u32;
    NOT_IMPLEMENTED            = 0xC000_0002u32;
    INFO_LENGTH_MISMATCH       = 0xC000_0004u32;
    ACCESS_VIOLATION           = 0xC000_0005u32;
    INVALID_HANDLE             = 0xC000_0008u32;
    INVALID_PARAMETER          = 0xC000_000Du32;
    NO_SUCH_DEVICE             = 0xC000_000Eu32;
    INVALID_DEVICE_REQUEST     = 0xC000_0010u32;
    NO_MEMORY                  = 0xC000_0017u32;
    NO_MEDIA_IN_DEVICE         = 0xC000_0013u32;
    ACCESS_DENIED              = 0xC000_0022u32;
    BUFFER_TOO_SMALL           = 0xC000_0023u32;
    OBJECT_NAME_NOT_FOUND      = 0xC000_0034u32;
    OBJECT_PATH_NOT_FOUND      = 0xC000_003Au32;
    SHARING_VIOLATION          = 0xC000_0043u32;
    LOCK_NOT_GRANTED           = 0xC000_0055u32;
    DISK_FULL                  = 0xC000_007Fu32;
    ILLEGAL_FUNCTION           = 0xC000_00AFu32;
    PIPE_DISCONNECTED          = 0xC000_00B0u32;
    IO_TIMEOUT                 = 0xC000_00B5u32;
    FILE_IS_A_DIRECTORY        = 0xC000_00BAu32;
    NOT_SUPPORTED              = 0xC000_00BBu32;
    BAD_DEVICE_TYPE            = 0xC000_00CBu32;
    DEVICE_NOT_READY           = 0xC000_00A3u32;
    DIRECTORY_NOT_EMPTY        = 0xC000_0101u32;
    TOO_MANY_OPENED_FILES      = 0xC000_011Fu32;
    CANCELLED                  = 0xC000_0120u32;
    FILE_LOCK_CONFLICT         = 0xC000_0054u32;
    REPARSE_POINT_NOT_RESOLVED = 0xC000_0280u32;
}

impl NtStatus {
    /// Success and informational codes; everything with the high bit set is an
    /// error.
    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub fn is_error(self) -> bool {
        self.0 < 0
    }

    /// Terminal means the operation has concluded; `PENDING` is the only
    /// non-terminal code.
    pub fn is_terminal(self) -> bool {
        self != NtStatus::PENDING
    }

    /// Translate a POSIX errno into the native vocabulary. Total and
    /// deterministic: the same errno always yields the same status, and any
    /// unmapped value degrades to `UNSUCCESSFUL` with a translation-gap
    /// diagnostic.
    pub fn from_errno(err: Errno) -> NtStatus {
        match err {
            Errno::EAGAIN => NtStatus::SHARING_VIOLATION,
            Errno::EBADF => NtStatus::INVALID_HANDLE,
            Errno::EBUSY => NtStatus::DEVICE_BUSY,
            Errno::ENOSPC => NtStatus::DISK_FULL,
            Errno::EPERM | Errno::EROFS | Errno::EACCES => NtStatus::ACCESS_DENIED,
            Errno::ENOTDIR => NtStatus::OBJECT_PATH_NOT_FOUND,
            Errno::ENOENT => NtStatus::OBJECT_NAME_NOT_FOUND,
            Errno::EISDIR => NtStatus::FILE_IS_A_DIRECTORY,
            Errno::EMFILE | Errno::ENFILE => NtStatus::TOO_MANY_OPENED_FILES,
            Errno::EINVAL => NtStatus::INVALID_PARAMETER,
            Errno::ENOTEMPTY => NtStatus::DIRECTORY_NOT_EMPTY,
            Errno::EPIPE | Errno::ECONNRESET => NtStatus::PIPE_DISCONNECTED,
            Errno::EIO => NtStatus::DEVICE_NOT_READY,
            Errno::ENOMEDIUM => NtStatus::NO_MEDIA_IN_DEVICE,
            Errno::ENXIO => NtStatus::NO_SUCH_DEVICE,
            Errno::ENOTTY | Errno::EOPNOTSUPP => NtStatus::NOT_SUPPORTED,
            Errno::EFAULT => NtStatus::ACCESS_VIOLATION,
            Errno::ESPIPE => NtStatus::ILLEGAL_FUNCTION,
            Errno::ELOOP => NtStatus::REPARSE_POINT_NOT_RESOLVED,
            Errno::ETIME => NtStatus::IO_TIMEOUT,
            other => {
                tracing::warn!(errno = other as i32, "no status mapping for errno, using UNSUCCESSFUL");
                NtStatus::UNSUCCESSFUL
            }
        }
    }

    /// Translate the calling thread's last platform error.
    pub fn from_current_errno() -> NtStatus {
        let err = Errno::last();
        tracing::trace!(errno = err as i32, "translating current errno");
        NtStatus::from_errno(err)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Caller-supplied out-parameter record for one operation: the final status and
/// an operation-specific result size (bytes transferred or written into an
/// output buffer).
///
/// Starts out `PENDING`. Whichever path first observes a terminal status fills
/// it exactly once; the `information` field is published before the status so a
/// waiter that sees a terminal status also sees the matching size.
pub struct IoStatusBlock {
    status: AtomicI32,
    information: AtomicUsize,
}

impl IoStatusBlock {
    pub fn new() -> Arc<IoStatusBlock> {
        Arc::new(IoStatusBlock {
            status: AtomicI32::new(NtStatus::PENDING.0),
            information: AtomicUsize::new(0),
        })
    }

    /// Record the terminal outcome. Must be called at most once per operation.
    pub fn set(&self, status: NtStatus, information: usize) {
        debug_assert!(status.is_terminal());
        self.information.store(information, Ordering::Relaxed);
        self.status.store(status.0, Ordering::Release);
    }

    pub fn status(&self) -> NtStatus {
        NtStatus(self.status.load(Ordering::Acquire))
    }

    pub fn information(&self) -> usize {
        self.information.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for IoStatusBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoStatusBlock")
            .field("status", &self.status())
            .field("information", &self.information())
            .finish()
    }
}
