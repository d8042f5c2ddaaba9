//! Wire protocol for the coordination service.
//!
//! Every call is one round trip: a fixed header (bincode) followed by a raw
//! variable-length input segment. The reply mirrors it: fixed header plus a
//! variable-length output segment, bounded by the caller's declared capacity.
//! Deferred terminations arrive out-of-band as [`ServerEvent`] frames.

use crate::status::NtStatus;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level bound on a single message (header + payload).
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Frame tags on the wire.
pub const FRAME_REQUEST: u8 = 0;
pub const FRAME_REPLY: u8 = 1;
pub const FRAME_EVENT: u8 = 2;

/// References the server needs to resolve a deferred completion: the resource
/// handle, the completion-object cookie, and the caller's I/O status block and
/// event identities.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default)]
pub struct AsyncData {
    pub handle: u64,
    pub user: u64,
    pub iosb: u64,
    pub event: u64,
}

/// Operation selector plus fixed per-operation parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum RequestBody {
    /// Generic device/filesystem control; input and (for non-buffered
    /// methods) echoed output ride in the input segment.
    Ioctl { code: u32 },
    /// Establish a directory watch.
    ReadDirectoryChanges {
        filter: u32,
        subtree: bool,
        want_data: bool,
    },
    /// Fetch the raw event batch after a watch wake.
    ReadChange,
    /// Fetch the reply payload of a deferred control operation.
    GetAsyncResult { user: u64 },
    LockFile {
        offset: u64,
        count: u64,
        shared: bool,
        wait: bool,
    },
    UnlockFile { offset: u64, count: u64 },
    /// Retained unix-path query for a handle.
    GetHandleUnixName,
    /// Mount-manager helper: classify the volume backing a drive root or raw
    /// device.
    QueryUnixDrive { letter: u8, unix_dev: u64 },
    /// Volume-information query for handles with no local descriptor.
    GetVolumeInfo { info_class: u32 },
    CancelAsync { iosb: u64, only_thread: bool },
    Flush,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct RequestHeader {
    pub handle: u64,
    pub body: RequestBody,
    pub async_data: Option<AsyncData>,
    pub input_len: u32,
    pub reply_cap: u32,
}

/// Reply options: how the caller should synchronize on a returned wait cookie.
pub const OPT_ALERTABLE: u32 = 1;
/// The lock conflict is held by a non-cooperating process at the platform
/// level; no wake signal exists.
pub const OPT_EXTERNAL_CONFLICT: u32 = 2;
/// The handle is opened for overlapped I/O (no synchronous wait possible).
pub const OPT_OVERLAPPED: u32 = 4;

#[derive(Serialize, Deserialize, Debug)]
pub struct ReplyHeader {
    pub status: NtStatus,
    /// Nonzero: a server-managed wait cookie the caller may block on.
    pub wait: u64,
    pub options: u32,
    /// On `BUFFER_OVERFLOW`, the size the caller should regrow to.
    pub size_hint: u32,
    pub output_len: u32,
}

/// Out-of-band frames from the service.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum ServerEvent {
    /// A parked asynchronous operation reached a terminal state (or needs its
    /// result fetched: `ALERTED`).
    Completion {
        user: u64,
        status: NtStatus,
        information: u64,
    },
    /// A wait cookie was signaled (cooperative lock release, sync wake).
    Signal { cookie: u64 },
}

/// Mount-manager reply payload for [`RequestBody::QueryUnixDrive`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UnixDriveInfo {
    pub fs_kind: u32,
    pub label: String,
    pub serial: u32,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message exceeds transport bound ({0} > {MAX_MESSAGE_SIZE})")]
    TooLarge(usize),
    #[error("truncated frame")]
    Truncated,
    #[error("bad frame encoding: {0}")]
    Encoding(#[from] bincode::Error),
}

fn encode_with_payload<T: Serialize>(header: &T, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let header = bincode::serialize(header)?;
    let total = 4 + header.len() + payload.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge(total));
    }
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32_le(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn decode_with_payload<T: for<'de> Deserialize<'de>>(
    frame: &[u8],
) -> Result<(T, Bytes), ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let header_len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
    let rest = &frame[4..];
    if rest.len() < header_len {
        return Err(ProtocolError::Truncated);
    }
    let header = bincode::deserialize(&rest[..header_len])?;
    Ok((header, Bytes::copy_from_slice(&rest[header_len..])))
}

pub fn encode_request(header: &RequestHeader, input: &[u8]) -> Result<Bytes, ProtocolError> {
    debug_assert_eq!(header.input_len as usize, input.len());
    encode_with_payload(header, input)
}

pub fn decode_request(frame: &[u8]) -> Result<(RequestHeader, Bytes), ProtocolError> {
    decode_with_payload(frame)
}

pub fn encode_reply(header: &ReplyHeader, output: &[u8]) -> Result<Bytes, ProtocolError> {
    debug_assert_eq!(header.output_len as usize, output.len());
    encode_with_payload(header, output)
}

pub fn decode_reply(frame: &[u8]) -> Result<(ReplyHeader, Bytes), ProtocolError> {
    decode_with_payload(frame)
}

pub fn encode_event(event: &ServerEvent) -> Result<Bytes, ProtocolError> {
    encode_with_payload(event, &[])
}

pub fn decode_event(frame: &[u8]) -> Result<ServerEvent, ProtocolError> {
    let (event, _) = decode_with_payload(frame)?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let header = RequestHeader {
            handle: 9,
            body: RequestBody::Ioctl { code: 0x0007_0000 },
            async_data: Some(AsyncData {
                handle: 9,
                user: 3,
                iosb: 0xdead,
                event: 0,
            }),
            input_len: 5,
            reply_cap: 64,
        };
        let frame = encode_request(&header, b"hello").unwrap();
        let (decoded, input) = decode_request(&frame).unwrap();
        assert_eq!(decoded.handle, 9);
        assert_eq!(decoded.reply_cap, 64);
        assert_eq!(input.as_ref(), b"hello");
        match decoded.body {
            RequestBody::Ioctl { code } => assert_eq!(code, 0x0007_0000),
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn reply_round_trip_with_overflow_hint() {
        let header = ReplyHeader {
            status: NtStatus::BUFFER_OVERFLOW,
            wait: 0,
            options: 0,
            size_hint: 1024,
            output_len: 0,
        };
        let frame = encode_reply(&header, &[]).unwrap();
        let (decoded, output) = decode_reply(&frame).unwrap();
        assert_eq!(decoded.status, NtStatus::BUFFER_OVERFLOW);
        assert_eq!(decoded.size_hint, 1024);
        assert!(output.is_empty());
    }

    #[test]
    fn oversized_message_is_rejected() {
        let header = RequestHeader {
            handle: 0,
            body: RequestBody::Flush,
            async_data: None,
            input_len: MAX_MESSAGE_SIZE as u32,
            reply_cap: 0,
        };
        let huge = vec![0u8; MAX_MESSAGE_SIZE];
        assert!(matches!(
            encode_request(&header, &huge),
            Err(ProtocolError::TooLarge(_))
        ));
    }
}
