//! Directory change notification.
//!
//! A watch is established with one deferred call; the service parks it and
//! wakes it when events accumulate. On wake the raw event batch is fetched and
//! converted into the caller-visible record format: aligned records carrying
//! UTF-16 names with native separators. Conversion is all-or-nothing per
//! batch: if any record would not fit the caller's buffer the whole batch is
//! discarded and the caller is told to rescan the directory instead of being
//! handed a partial view.

use crate::aio::{AioCallback, AioKind};
use crate::config::Config;
use crate::handle::FileHandle;
use crate::server::ServerClient;
use crate::server::protocol::RequestBody;
use crate::status::{IoStatusBlock, NtStatus};
use bitflags::bitflags;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{trace, warn};

bitflags! {
    /// Event classes a watch can subscribe to.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NotifyFilter: u32 {
        const FILE_NAME   = 0x0000_0001;
        const DIR_NAME    = 0x0000_0002;
        const ATTRIBUTES  = 0x0000_0004;
        const SIZE        = 0x0000_0008;
        const LAST_WRITE  = 0x0000_0010;
        const LAST_ACCESS = 0x0000_0020;
        const CREATION    = 0x0000_0040;
        const SECURITY    = 0x0000_0100;
    }
}

/// Change actions carried by each record.
pub const ACTION_ADDED: u32 = 1;
pub const ACTION_REMOVED: u32 = 2;
pub const ACTION_MODIFIED: u32 = 3;
pub const ACTION_RENAMED_OLD_NAME: u32 = 4;
pub const ACTION_RENAMED_NEW_NAME: u32 = 5;

/// Fixed part of one caller-visible record: next offset, action, name length.
const RECORD_HEADER_LEN: usize = 12;
/// Fixed part of one raw service event: action, name length.
const RAW_HEADER_LEN: usize = 8;

/// Establish a directory watch. The filter is validated before anything is
/// sent: an empty or unrecognized filter never reaches the service.
///
/// Completion delivers the converted record batch through `callback`; the
/// caller's buffer capacity only bounds conversion, the bytes themselves
/// arrive in the callback payload.
pub async fn read_directory_changes(
    client: &ServerClient,
    config: &Config,
    handle: &FileHandle,
    iosb: Arc<IoStatusBlock>,
    buffer_size: usize,
    filter: u32,
    subtree: bool,
    callback: AioCallback,
) -> NtStatus {
    if filter == 0 || NotifyFilter::from_bits(filter).is_none() {
        warn!(filter, "rejecting watch with invalid filter");
        return NtStatus::INVALID_PARAMETER;
    }

    let want_data = buffer_size > 0;
    // The raw ring must hold at least a few events even for tiny caller
    // buffers, otherwise every wake degenerates into a rescan.
    let data_size = buffer_size.max(config.notify_min_buffer);

    let io = match client.pool().acquire(
        AioKind::ReadChanges {
            data_size,
            out_cap: buffer_size,
            want_data,
        },
        callback,
        handle.server_id(),
        iosb.clone(),
    ) {
        Ok(io) => io,
        Err(status) => return status,
    };

    let reply = client
        .call_async(
            handle.server_id(),
            RequestBody::ReadDirectoryChanges {
                filter,
                subtree,
                want_data,
            },
            &[],
            0,
            io,
        )
        .await;
    trace!(handle = handle.server_id(), filter, subtree, ?reply.status, "watch established");
    reply.status
}

/// Resolve a woken watch: fetch the raw batch and convert it. Called from the
/// completion dispatcher.
pub(crate) async fn complete_watch(
    client: &ServerClient,
    handle: u64,
    data_size: usize,
    out_cap: usize,
    want_data: bool,
    status: NtStatus,
) -> (NtStatus, usize, Bytes) {
    if status != NtStatus::ALERTED {
        // Cancelled or failed before any event arrived.
        return (status, 0, Bytes::new());
    }
    let reply = client
        .call(handle, RequestBody::ReadChange, &[], data_size)
        .await;
    if reply.status.is_error() {
        // The watch already fired; a failed fetch loses the batch, so the
        // caller rescans rather than seeing a raw service error.
        warn!(handle, ?reply.status, "change batch fetch failed, forcing a rescan");
        return (NtStatus::NOTIFY_ENUM_DIR, 0, Bytes::new());
    }
    if !want_data {
        return (NtStatus::NOTIFY_ENUM_DIR, 0, Bytes::new());
    }
    match convert_batch(&reply.data, out_cap) {
        Some(records) => {
            let len = records.len();
            (NtStatus::SUCCESS, len, Bytes::from(records))
        }
        None => (NtStatus::NOTIFY_ENUM_DIR, 0, Bytes::new()),
    }
}

/// Convert a raw event batch into caller-visible records.
///
/// Names arrive as unix byte strings; they are re-encoded to UTF-16 with `/`
/// rewritten to `\`. Records are 4-byte aligned and chained through
/// `next_entry_offset`, zero on the last one. Returns `None` when the batch
/// does not fit in `capacity` — never a truncated prefix.
pub fn convert_batch(raw: &[u8], capacity: usize) -> Option<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();
    let mut last_record = None;
    let mut offset = 0usize;

    while offset + RAW_HEADER_LEN <= raw.len() {
        let action = u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap());
        let name_len = u32::from_le_bytes(raw[offset + 4..offset + 8].try_into().unwrap()) as usize;
        let name_start = offset + RAW_HEADER_LEN;
        let Some(name) = raw.get(name_start..name_start + name_len) else {
            warn!(offset, name_len, "truncated raw change event, dropping batch tail");
            break;
        };
        offset = (name_start + name_len + 3) & !3;

        // Align the new record and patch the previous one's chain offset.
        while out.len() % 4 != 0 {
            out.push(0);
        }
        let record_start = out.len();
        if let Some(prev) = last_record {
            let delta = (record_start - prev) as u32;
            out[prev..prev + 4].copy_from_slice(&delta.to_le_bytes());
        }

        let utf16: Vec<u16> = String::from_utf8_lossy(name)
            .chars()
            .map(|c| if c == '/' { '\\' } else { c })
            .collect::<String>()
            .encode_utf16()
            .collect();

        out.extend_from_slice(&0u32.to_le_bytes()); // next_entry_offset, patched later
        out.extend_from_slice(&action.to_le_bytes());
        out.extend_from_slice(&((utf16.len() * 2) as u32).to_le_bytes());
        for unit in &utf16 {
            out.extend_from_slice(&unit.to_le_bytes());
        }

        if out.len() > capacity {
            return None;
        }
        last_record = Some(record_start);
    }

    Some(out)
}

/// Decoded view of one converted record.
#[derive(Debug, PartialEq, Eq)]
pub struct NotifyRecord {
    pub action: u32,
    pub name: String,
}

/// Iterate the records of a converted batch.
pub fn records(batch: &[u8]) -> impl Iterator<Item = NotifyRecord> + '_ {
    let mut offset = Some(0usize);
    std::iter::from_fn(move || {
        let start = offset?;
        if start + RECORD_HEADER_LEN > batch.len() {
            return None;
        }
        let next = u32::from_le_bytes(batch[start..start + 4].try_into().ok()?) as usize;
        let action = u32::from_le_bytes(batch[start + 4..start + 8].try_into().ok()?);
        let name_len = u32::from_le_bytes(batch[start + 8..start + 12].try_into().ok()?) as usize;
        let name_bytes = batch.get(start + RECORD_HEADER_LEN..start + RECORD_HEADER_LEN + name_len)?;
        let units: Vec<u16> = name_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        offset = if next == 0 { None } else { Some(start + next) };
        Some(NotifyRecord {
            action,
            name: String::from_utf16_lossy(&units),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_event(action: u32, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&action.to_le_bytes());
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    #[test]
    fn converts_names_to_utf16_with_native_separators() {
        let mut raw = raw_event(ACTION_ADDED, "sub/dir/file.txt");
        raw.extend(raw_event(ACTION_REMOVED, "gone"));
        let batch = convert_batch(&raw, 4096).unwrap();
        let decoded: Vec<NotifyRecord> = records(&batch).collect();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].action, ACTION_ADDED);
        assert_eq!(decoded[0].name, "sub\\dir\\file.txt");
        assert_eq!(decoded[1].action, ACTION_REMOVED);
        assert_eq!(decoded[1].name, "gone");
    }

    #[test]
    fn last_record_terminates_the_chain() {
        let raw = raw_event(ACTION_MODIFIED, "a");
        let batch = convert_batch(&raw, 4096).unwrap();
        assert_eq!(u32::from_le_bytes(batch[..4].try_into().unwrap()), 0);
    }

    #[test]
    fn overflow_discards_the_whole_batch() {
        let mut raw = raw_event(ACTION_ADDED, "first");
        raw.extend(raw_event(ACTION_ADDED, "second-name-that-will-not-fit"));
        // Capacity holds the first record but not the second.
        assert!(convert_batch(&raw, 40).is_none());
    }

    #[test]
    fn non_utf8_names_degrade_instead_of_failing() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&ACTION_ADDED.to_le_bytes());
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.extend_from_slice(&[0xff, 0xfe, b'x', 0]);
        let batch = convert_batch(&raw, 4096).unwrap();
        let decoded: Vec<NotifyRecord> = records(&batch).collect();
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].name.ends_with('x'));
    }

    #[test]
    fn truncated_raw_event_drops_only_the_tail() {
        let mut raw = raw_event(ACTION_ADDED, "ok");
        raw.extend_from_slice(&ACTION_REMOVED.to_le_bytes());
        raw.extend_from_slice(&100u32.to_le_bytes()); // claims more than exists
        raw.extend_from_slice(b"shrt");
        let batch = convert_batch(&raw, 4096).unwrap();
        let decoded: Vec<NotifyRecord> = records(&batch).collect();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "ok");
    }

    #[test]
    fn empty_batch_converts_to_empty_output() {
        assert_eq!(convert_batch(&[], 4096), Some(Vec::new()));
    }

    #[test]
    fn filter_validation_covers_all_known_bits() {
        assert!(NotifyFilter::from_bits(0x17f).is_some());
        assert!(NotifyFilter::from_bits(0x80).is_none());
        assert!(NotifyFilter::from_bits(0x200).is_none());
    }
}
