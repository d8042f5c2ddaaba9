//! Handle-level file operations that are not reads or writes.

use crate::aio::AioKind;
use crate::handle::FileHandle;
use crate::server::ServerClient;
use crate::server::protocol::RequestBody;
use crate::status::{IoStatusBlock, NtStatus};
use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

/// Flush buffered data for a handle. Locally backed handles sync through the
/// descriptor; pure service objects (pipes, mailslots, devices) flush through
/// the service, waiting for the device queue to drain.
pub async fn flush_buffers(client: &ServerClient, handle: &FileHandle) -> NtStatus {
    if let Some(raw) = handle.unix_fd() {
        let result = tokio::task::spawn_blocking(move || nix::unistd::fsync(raw)).await;
        return match result {
            Ok(Ok(())) => NtStatus::SUCCESS,
            Ok(Err(err)) => NtStatus::from_errno(err),
            Err(_) => NtStatus::UNSUCCESSFUL,
        };
    }

    let iosb = IoStatusBlock::new();
    let io = match client.pool().acquire(
        AioKind::Irp { buffer: Vec::new() },
        Box::new(|_, _| {}),
        handle.server_id(),
        iosb.clone(),
    ) {
        Ok(io) => io,
        Err(status) => return status,
    };
    let reply = client
        .call_async(handle.server_id(), RequestBody::Flush, &[], 0, io)
        .await;
    match reply.wait {
        Some(wait) if reply.status == NtStatus::PENDING => {
            client.wait_async(wait, false, &iosb).await
        }
        _ => reply.status,
    }
}

/// Cancel every in-flight operation the caller has on a handle.
pub async fn cancel_io(client: &ServerClient, handle: &FileHandle) -> NtStatus {
    trace!(handle = handle.server_id(), "cancelling all operations");
    client.cancel_io(handle.server_id(), None).await
}

/// Cancel only the in-flight operations matching one I/O status block.
pub async fn cancel_io_ex(
    client: &ServerClient,
    handle: &FileHandle,
    iosb: &Arc<IoStatusBlock>,
) -> NtStatus {
    trace!(handle = handle.server_id(), "cancelling matching operations");
    client.cancel_io(handle.server_id(), Some(iosb)).await
}

/// Payload sink that drops deferred data, for operations whose callers only
/// consult the status block.
pub fn discard_payload() -> crate::aio::AioCallback {
    Box::new(|_: NtStatus, _: Bytes| {})
}
