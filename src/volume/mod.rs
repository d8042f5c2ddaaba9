//! Device and volume classification.
//!
//! Maps unix file descriptors onto a device-oriented description: a device
//! type, a set of characteristics, and for mounted filesystems a category
//! derived from the filesystem magic. The magic table is heuristic and
//! platform-dependent by nature, so callers can extend it through
//! [`crate::config::FsMagicOverride`] rather than patching the built-ins.

pub mod mountmgr;

use crate::config::{Config, FsMagicOverride};
use crate::handle::FileHandle;
use crate::server::ServerClient;
use crate::server::protocol::RequestBody;
use crate::status::NtStatus;
use bitflags::bitflags;
use nix::errno::Errno;
use nix::sys::stat::{FileStat, SFlag, fstat, major};
use std::os::fd::RawFd;
use tracing::{debug, warn};

/// Device class reported to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceType {
    Cdrom = 0x02,
    CdromFileSystem = 0x03,
    Disk = 0x07,
    DiskFileSystem = 0x08,
    NamedPipe = 0x11,
    NetworkFileSystem = 0x14,
    Null = 0x15,
    ParallelPort = 0x16,
    SerialPort = 0x1b,
    Tape = 0x1f,
    Unknown = 0x22,
    VirtualDisk = 0x24,
}

bitflags! {
    /// Device characteristic flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DeviceCharacteristics: u32 {
        /// Media can be removed while the device stays.
        const REMOVABLE_MEDIA   = 0x0000_0001;
        const READ_ONLY_DEVICE  = 0x0000_0002;
        const FLOPPY_DISKETTE   = 0x0000_0004;
        const WRITE_ONCE_MEDIA  = 0x0000_0008;
        /// Backed by a network peer rather than local storage.
        const REMOTE_DEVICE     = 0x0000_0010;
        /// A filesystem is currently mounted on the device.
        const DEVICE_IS_MOUNTED = 0x0000_0020;
        const VIRTUAL_VOLUME    = 0x0000_0040;
    }
}

/// Filesystem category, the classification a statfs magic resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsCategory {
    /// Optical media filesystem: removable, read-only.
    CdromFs,
    /// Network-backed filesystem.
    Network,
    /// Memory- or kernel-backed pseudo filesystem.
    VirtualDisk,
    /// Ordinary local disk filesystem. Also the fallback for unknown magics.
    DiskFs,
}

impl FsCategory {
    pub fn device_type(self) -> DeviceType {
        match self {
            FsCategory::CdromFs => DeviceType::CdromFileSystem,
            FsCategory::Network => DeviceType::NetworkFileSystem,
            FsCategory::VirtualDisk => DeviceType::VirtualDisk,
            FsCategory::DiskFs => DeviceType::DiskFileSystem,
        }
    }

    pub fn characteristics(self) -> DeviceCharacteristics {
        match self {
            FsCategory::CdromFs => {
                DeviceCharacteristics::REMOVABLE_MEDIA | DeviceCharacteristics::READ_ONLY_DEVICE
            }
            FsCategory::Network => DeviceCharacteristics::REMOTE_DEVICE,
            FsCategory::VirtualDisk | FsCategory::DiskFs => DeviceCharacteristics::empty(),
        }
    }
}

/// Result of classifying one descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_type: DeviceType,
    pub characteristics: DeviceCharacteristics,
}

/// What the descriptor points at, reduced to the facts classification needs.
#[derive(Clone, Copy, Debug)]
pub enum FileKind {
    CharDevice { major: u64 },
    BlockDevice { major: u64 },
    Fifo,
    Socket,
    /// Regular file or directory on a mounted filesystem, with the statfs
    /// magic when one could be read.
    Mounted { magic: Option<i64> },
}

// Linux character/block major numbers with a fixed meaning.
const MEM_MAJOR: u64 = 1;
const FLOPPY_MAJOR: u64 = 2;
const TTY_MAJOR: u64 = 4;
const TTYAUX_MAJOR: u64 = 5;
const LP_MAJOR: u64 = 6;
const SCSI_TAPE_MAJOR: u64 = 9;

/// Built-in statfs-magic table.
fn builtin_category(magic: i64) -> Option<FsCategory> {
    match magic {
        // iso9660, supermount-over-iso9660, UDF
        0x9660 | 0x9fa1 | 0x1501_3346 => Some(FsCategory::CdromFs),
        // NFS, CIFS, SMB2, SMB, NCP
        0x6969 | 0xff53_4d42 | 0xfe53_4d42 | 0x517b | 0x564c => Some(FsCategory::Network),
        // tmpfs, cramfs, devfs, procfs
        0x0102_1994 | 0x28cd_3d45 | 0x1373 | 0x9fa0 => Some(FsCategory::VirtualDisk),
        _ => None,
    }
}

fn magic_category(magic: i64, overrides: &[FsMagicOverride]) -> FsCategory {
    if let Some(ov) = overrides.iter().find(|ov| ov.magic == magic) {
        return ov.kind;
    }
    builtin_category(magic).unwrap_or(FsCategory::DiskFs)
}

/// Pure classification: same inputs, same answer, no side effects.
pub fn classify(kind: FileKind, overrides: &[FsMagicOverride]) -> DeviceInfo {
    match kind {
        FileKind::CharDevice { major } => {
            let device_type = match major {
                MEM_MAJOR => DeviceType::Null,
                TTY_MAJOR | TTYAUX_MAJOR => DeviceType::SerialPort,
                LP_MAJOR => DeviceType::ParallelPort,
                SCSI_TAPE_MAJOR => DeviceType::Tape,
                _ => DeviceType::Unknown,
            };
            DeviceInfo {
                device_type,
                characteristics: DeviceCharacteristics::empty(),
            }
        }
        FileKind::BlockDevice { major } => {
            let mut characteristics = DeviceCharacteristics::empty();
            if major == FLOPPY_MAJOR {
                characteristics |= DeviceCharacteristics::REMOVABLE_MEDIA;
            }
            DeviceInfo {
                device_type: DeviceType::Disk,
                characteristics,
            }
        }
        FileKind::Fifo | FileKind::Socket => DeviceInfo {
            device_type: DeviceType::NamedPipe,
            characteristics: DeviceCharacteristics::empty(),
        },
        FileKind::Mounted { magic } => {
            let category = match magic {
                Some(magic) => magic_category(magic, overrides),
                None => FsCategory::DiskFs,
            };
            DeviceInfo {
                device_type: category.device_type(),
                characteristics: category.characteristics()
                    | DeviceCharacteristics::DEVICE_IS_MOUNTED,
            }
        }
    }
}

fn file_kind(st: &FileStat, magic: Option<i64>) -> FileKind {
    // The format bits overlap, so only an exact match on the masked value is
    // meaningful.
    let fmt = SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits());
    if fmt == SFlag::S_IFCHR {
        FileKind::CharDevice {
            major: major(st.st_rdev),
        }
    } else if fmt == SFlag::S_IFBLK {
        FileKind::BlockDevice {
            major: major(st.st_rdev),
        }
    } else if fmt == SFlag::S_IFIFO {
        FileKind::Fifo
    } else if fmt == SFlag::S_IFSOCK {
        FileKind::Socket
    } else {
        FileKind::Mounted { magic }
    }
}

pub(crate) fn fs_magic(fd: RawFd) -> Result<i64, Errno> {
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    // Safety: fstatfs fills the struct on success; fd stays open for the call.
    if unsafe { libc::fstatfs(fd, &mut st) } != 0 {
        return Err(Errno::last());
    }
    Ok(st.f_type as i64)
}

/// Classify a live descriptor from `fstat` plus, for mounted filesystems, the
/// statfs magic.
pub fn classify_fd(fd: RawFd, overrides: &[FsMagicOverride]) -> Result<DeviceInfo, NtStatus> {
    let st = fstat(fd).map_err(NtStatus::from_errno)?;
    let magic = match fs_magic(fd) {
        Ok(magic) => Some(magic),
        Err(err) => {
            debug!(fd, errno = err as i32, "statfs failed, using disk defaults");
            None
        }
    };
    Ok(classify(file_kind(&st, magic), overrides))
}

/// Volume information classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum VolumeInfoClass {
    Volume = 1,
    Label = 2,
    Size = 3,
    Device = 4,
    Attribute = 5,
    Control = 6,
    FullSize = 7,
    ObjectId = 8,
}

impl VolumeInfoClass {
    pub fn from_raw(raw: u32) -> Option<VolumeInfoClass> {
        match raw {
            1 => Some(VolumeInfoClass::Volume),
            2 => Some(VolumeInfoClass::Label),
            3 => Some(VolumeInfoClass::Size),
            4 => Some(VolumeInfoClass::Device),
            5 => Some(VolumeInfoClass::Attribute),
            6 => Some(VolumeInfoClass::Control),
            7 => Some(VolumeInfoClass::FullSize),
            8 => Some(VolumeInfoClass::ObjectId),
            _ => None,
        }
    }
}

/// Filesystem kind reported by the mount-manager endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsKind {
    Ntfs,
    Fat,
    Fat32,
    Cdfs,
    Udf,
}

impl FsKind {
    pub fn from_wire(raw: u32) -> Option<FsKind> {
        match raw {
            0 => Some(FsKind::Ntfs),
            1 => Some(FsKind::Fat),
            2 => Some(FsKind::Fat32),
            3 => Some(FsKind::Cdfs),
            4 => Some(FsKind::Udf),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FsKind::Ntfs => "NTFS",
            FsKind::Fat => "FAT",
            FsKind::Fat32 => "FAT32",
            FsKind::Cdfs => "CDFS",
            FsKind::Udf => "UDF",
        }
    }

    /// Filesystem attribute flags: case preservation, unicode names,
    /// persistent ACLs, read-only volumes.
    pub fn attributes(self) -> u32 {
        const CASE_PRESERVED: u32 = 0x0000_0002;
        const UNICODE_ON_DISK: u32 = 0x0000_0004;
        const PERSISTENT_ACLS: u32 = 0x0000_0008;
        const READ_ONLY_VOLUME: u32 = 0x0008_0000;
        match self {
            FsKind::Ntfs => CASE_PRESERVED | UNICODE_ON_DISK | PERSISTENT_ACLS,
            FsKind::Fat | FsKind::Fat32 => CASE_PRESERVED | UNICODE_ON_DISK,
            FsKind::Cdfs | FsKind::Udf => CASE_PRESERVED | UNICODE_ON_DISK | READ_ONLY_VOLUME,
        }
    }

    pub fn max_component_len(self) -> u32 {
        match self {
            FsKind::Fat => 12,
            _ => 255,
        }
    }
}

fn put_u16_str(out: &mut Vec<u8>, s: &str) {
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
}

/// Answer a volume-information query for a handle, writing the encoded record
/// into `buffer`. Returns the status and the number of bytes produced.
///
/// Handles without a local descriptor are forwarded to the coordination
/// service, which owns the backing object.
pub async fn query_volume_info(
    client: &ServerClient,
    config: &Config,
    handle: &FileHandle,
    class: VolumeInfoClass,
    buffer: &mut [u8],
) -> (NtStatus, usize) {
    let fd = match handle.unix_fd() {
        Some(fd) => fd,
        None => {
            let reply = client
                .call(
                    handle.server_id(),
                    RequestBody::GetVolumeInfo {
                        info_class: class as u32,
                    },
                    &[],
                    buffer.len(),
                )
                .await;
            let n = reply.data.len().min(buffer.len());
            buffer[..n].copy_from_slice(&reply.data[..n]);
            return (reply.status, n);
        }
    };

    match class {
        VolumeInfoClass::Device => {
            if buffer.len() < 8 {
                return (NtStatus::INFO_LENGTH_MISMATCH, 0);
            }
            let info = match classify_fd(fd, &config.fs_magic_overrides) {
                Ok(info) => info,
                Err(status) => return (status, 0),
            };
            buffer[..4].copy_from_slice(&(info.device_type as u32).to_le_bytes());
            buffer[4..8].copy_from_slice(&info.characteristics.bits().to_le_bytes());
            (NtStatus::SUCCESS, 8)
        }
        VolumeInfoClass::Size => query_size_info(fd, buffer),
        VolumeInfoClass::Attribute => {
            if buffer.len() < 12 {
                return (NtStatus::INFO_LENGTH_MISMATCH, 0);
            }
            // Mount-manager failures degrade to local-disk defaults here.
            let kind = match mountmgr::query_fs_info(client, config, handle).await {
                Ok(info) => FsKind::from_wire(info.fs_kind).unwrap_or(FsKind::Ntfs),
                Err(status) => {
                    debug!(?status, "mount-manager query failed, assuming NTFS");
                    FsKind::Ntfs
                }
            };
            let mut out = Vec::new();
            out.extend_from_slice(&kind.attributes().to_le_bytes());
            out.extend_from_slice(&kind.max_component_len().to_le_bytes());
            out.extend_from_slice(&((kind.name().len() * 2) as u32).to_le_bytes());
            put_u16_str(&mut out, kind.name());
            copy_variable(buffer, &out, 12)
        }
        VolumeInfoClass::Volume => {
            if buffer.len() < 18 {
                return (NtStatus::INFO_LENGTH_MISMATCH, 0);
            }
            // No local source of label or serial exists; this answer requires
            // the mount-manager endpoint.
            let info = match mountmgr::query_fs_info(client, config, handle).await {
                Ok(info) => info,
                Err(status) => {
                    debug!(?status, "mount-manager query failed, no volume info");
                    return (NtStatus::NOT_IMPLEMENTED, 0);
                }
            };
            let mut out = Vec::new();
            out.extend_from_slice(&0u64.to_le_bytes()); // creation time: unknown
            out.extend_from_slice(&info.serial.to_le_bytes());
            out.extend_from_slice(&((info.label.encode_utf16().count() * 2) as u32).to_le_bytes());
            out.extend_from_slice(&[1, 0]); // supports objects + pad
            put_u16_str(&mut out, &info.label);
            copy_variable(buffer, &out, 18)
        }
        VolumeInfoClass::Label
        | VolumeInfoClass::Control
        | VolumeInfoClass::FullSize
        | VolumeInfoClass::ObjectId => {
            warn!(?class, "volume information class not implemented");
            (NtStatus::NOT_IMPLEMENTED, 0)
        }
    }
}

/// Entry point for callers holding a raw class number.
pub async fn query_volume_info_raw(
    client: &ServerClient,
    config: &Config,
    handle: &FileHandle,
    class: u32,
    buffer: &mut [u8],
) -> (NtStatus, usize) {
    match VolumeInfoClass::from_raw(class) {
        Some(class) => query_volume_info(client, config, handle, class, buffer).await,
        None => {
            warn!(class, "unknown volume information class");
            (NtStatus::INVALID_PARAMETER, 0)
        }
    }
}

/// Copy an encoded record with a variable-length tail: the fixed part must
/// fit (checked by the caller), the tail may truncate with `BUFFER_OVERFLOW`.
fn copy_variable(buffer: &mut [u8], encoded: &[u8], fixed: usize) -> (NtStatus, usize) {
    debug_assert!(buffer.len() >= fixed);
    if encoded.len() <= buffer.len() {
        buffer[..encoded.len()].copy_from_slice(encoded);
        (NtStatus::SUCCESS, encoded.len())
    } else {
        let n = buffer.len();
        buffer.copy_from_slice(&encoded[..n]);
        (NtStatus::BUFFER_OVERFLOW, n)
    }
}

fn query_size_info(fd: RawFd, buffer: &mut [u8]) -> (NtStatus, usize) {
    if buffer.len() < 24 {
        return (NtStatus::INFO_LENGTH_MISMATCH, 0);
    }
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    // Safety: fstatfs fills the struct on success.
    if unsafe { libc::fstatfs(fd, &mut st) } != 0 {
        return (NtStatus::from_current_errno(), 0);
    }
    // A 2048-byte block size means optical media; everything else reports
    // conventional 512-byte sectors.
    let bytes_per_sector: u32 = if st.f_bsize == 2048 { 2048 } else { 512 };
    let sectors_per_unit = ((st.f_bsize as u64).max(bytes_per_sector as u64)
        / bytes_per_sector as u64) as u32;
    buffer[..8].copy_from_slice(&(st.f_blocks as i64).to_le_bytes());
    buffer[8..16].copy_from_slice(&(st.f_bavail as i64).to_le_bytes());
    buffer[16..20].copy_from_slice(&sectors_per_unit.to_le_bytes());
    buffer[20..24].copy_from_slice(&bytes_per_sector.to_le_bytes());
    (NtStatus::SUCCESS, 24)
}
