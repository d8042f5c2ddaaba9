//! Byte-range lock coordination.
//!
//! Lock state lives in the coordination service so ranges are arbitrated
//! across every process sharing a file. Acquisition is a retry loop: each
//! conflict reply says whether the current owner is a cooperating peer (the
//! service will signal its release) or an external process holding a platform
//! lock (nothing to wait on, so the loop polls).

use crate::aio::AioCallback;
use crate::config::Config;
use crate::handle::FileHandle;
use crate::server::protocol::{self, RequestBody};
use crate::server::{ServerClient, ServerReply, WaitHandle};
use crate::status::{IoStatusBlock, NtStatus};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{trace, warn};

/// One byte range, by absolute offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub count: u64,
}

/// Why a lock attempt did not conclude.
enum PendingConflict {
    /// A cooperating peer owns the range; the service hands out a wake signal
    /// for its release.
    Cooperative(WaitHandle),
    /// The range is held by an outside process at the platform level; no
    /// signal exists and the only option is to retry after a delay.
    External,
}

fn classify_pending(reply: &mut ServerReply) -> PendingConflict {
    if reply.options & protocol::OPT_EXTERNAL_CONFLICT != 0 {
        return PendingConflict::External;
    }
    match reply.wait.take() {
        Some(wait) => PendingConflict::Cooperative(wait),
        None => PendingConflict::External,
    }
}

/// Acquire a byte-range lock, blocking until granted unless `dont_wait`.
///
/// Asynchronous acquisition (a completion callback or caller-observed status
/// block) is not supported: lock arbitration is inherently a blocking
/// conversation with the service, and pretending otherwise would deadlock
/// callers. Such requests are rejected up front.
pub async fn lock_file(
    client: &ServerClient,
    config: &Config,
    handle: &FileHandle,
    completion: Option<AioCallback>,
    io_status: Option<Arc<IoStatusBlock>>,
    key: u32,
    range: ByteRange,
    dont_wait: bool,
    exclusive: bool,
    granted: Option<Arc<Notify>>,
) -> NtStatus {
    if completion.is_some() || io_status.is_some() || key != 0 {
        warn!("asynchronous byte-range locking is not supported");
        return NtStatus::NOT_IMPLEMENTED;
    }

    loop {
        let mut reply = client
            .call(
                handle.server_id(),
                RequestBody::LockFile {
                    offset: range.offset,
                    count: range.count,
                    shared: !exclusive,
                    wait: !dont_wait,
                },
                &[],
                0,
            )
            .await;

        if reply.status.is_terminal() {
            if reply.status.is_success() {
                if let Some(granted) = &granted {
                    granted.notify_one();
                }
            }
            return reply.status;
        }

        // Overlapped handles cannot wait synchronously for the grant; there
        // is no correct way to finish this request.
        if reply.options & protocol::OPT_OVERLAPPED != 0 {
            warn!(?range, "cannot wait for a byte-range lock on an overlapped handle");
            return NtStatus::NOT_IMPLEMENTED;
        }
        debug_assert!(!dont_wait, "conflict without wait must be terminal");

        match classify_pending(&mut reply) {
            PendingConflict::Cooperative(wait) => {
                trace!(?range, "waiting for cooperative lock release");
                client.wait(wait).await;
            }
            PendingConflict::External => {
                trace!(?range, interval = ?config.lock_retry_interval, "external conflict, polling");
                tokio::time::sleep(config.lock_retry_interval).await;
            }
        }
    }
}

/// Release one previously granted byte range. A single call either removes
/// the range or reports why it could not. The asynchronous out-parameters are
/// rejected for the same reason they are on acquisition.
pub async fn unlock_file(
    client: &ServerClient,
    handle: &FileHandle,
    io_status: Option<Arc<IoStatusBlock>>,
    key: u32,
    range: ByteRange,
) -> NtStatus {
    if io_status.is_some() || key != 0 {
        warn!("asynchronous byte-range unlocking is not supported");
        return NtStatus::NOT_IMPLEMENTED;
    }
    client
        .call(
            handle.server_id(),
            RequestBody::UnlockFile {
                offset: range.offset,
                count: range.count,
            },
            &[],
            0,
        )
        .await
        .status
}
