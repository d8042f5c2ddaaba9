//! Client side of the out-of-process coordination service.
//!
//! All cross-process state (watches, byte-range locks, device queues, shared
//! handle metadata) lives in the service; this module is the calling side.
//! Synchronous operations use [`ServerClient::call`]; operations that may park
//! attach a completion block via [`ServerClient::call_async`] and learn their
//! terminal state from an event frame, possibly long after the reply.

pub mod protocol;
pub mod transport;

use crate::aio::{AioKind, AioPool, AsyncIo};
use crate::status::{IoStatusBlock, NtStatus};
use bytes::Bytes;
use protocol::{AsyncData, ReplyHeader, RequestBody, RequestHeader, ServerEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};
use transport::Transport;

/// Stable identity of an I/O status block, used to match cancellation requests
/// against in-flight operations.
pub fn iosb_id(iosb: &Arc<IoStatusBlock>) -> u64 {
    Arc::as_ptr(iosb) as usize as u64
}

/// Decoded reply of one synchronous call.
pub struct ServerReply {
    pub status: NtStatus,
    pub data: Bytes,
    /// Advertised regrow size on `BUFFER_OVERFLOW`.
    pub size_hint: usize,
    pub options: u32,
    pub wait: Option<WaitHandle>,
}

/// Wake signals for server wait cookies, keyed by cookie.
type WaitRegistry = Mutex<HashMap<u64, Arc<Notify>>>;

/// A server-managed wait cookie bound to a client-side wake signal. The signal
/// holds one permit, so a wake that lands before the waiter blocks is not lost.
///
/// Dropping the handle unregisters the cookie, so a wait the caller never
/// consumes does not pin its signal in the registry.
pub struct WaitHandle {
    cookie: u64,
    notify: Arc<Notify>,
    registry: Weak<WaitRegistry>,
}

impl WaitHandle {
    pub fn cookie(&self) -> u64 {
        self.cookie
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.cookie);
        }
    }
}

struct PendingEntry {
    io: Box<AsyncIo>,
    /// Wait cookie to signal once the operation terminates, when the reply
    /// carried one. `None` until the reply is decoded.
    wait_cookie: Option<u64>,
}

pub struct ServerClient {
    transport: Arc<dyn Transport>,
    pool: Arc<AioPool>,
    /// Parked completion blocks, keyed by the per-operation cookie.
    pending: Mutex<HashMap<u64, PendingEntry>>,
    waits: Arc<WaitRegistry>,
    /// Alert delivery for alertable waits.
    alert: Notify,
    next_user: AtomicU64,
}

impl ServerClient {
    /// Wrap a connected transport and start the event dispatcher.
    pub fn new(transport: Arc<dyn Transport>, pool: Arc<AioPool>) -> Arc<ServerClient> {
        let client = Arc::new(ServerClient {
            transport,
            pool,
            pending: Mutex::new(HashMap::new()),
            waits: Arc::new(Mutex::new(HashMap::new())),
            alert: Notify::new(),
            next_user: AtomicU64::new(1),
        });
        tokio::spawn(client.clone().dispatch_events());
        client
    }

    pub fn pool(&self) -> &Arc<AioPool> {
        &self.pool
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingEntry>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_signal(&self, cookie: u64) -> Arc<Notify> {
        self.waits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(cookie)
            .or_default()
            .clone()
    }

    fn wait_handle(&self, cookie: u64) -> WaitHandle {
        WaitHandle {
            cookie,
            notify: self.wait_signal(cookie),
            registry: Arc::downgrade(&self.waits),
        }
    }

    /// One synchronous round trip. Transport loss degrades to
    /// `PIPE_DISCONNECTED` so callers keep a uniform status-based error path.
    pub async fn call(
        &self,
        handle: u64,
        body: RequestBody,
        input: &[u8],
        reply_cap: usize,
    ) -> ServerReply {
        self.call_inner(handle, body, None, input, reply_cap).await
    }

    async fn call_inner(
        &self,
        handle: u64,
        body: RequestBody,
        async_data: Option<AsyncData>,
        input: &[u8],
        reply_cap: usize,
    ) -> ServerReply {
        let header = RequestHeader {
            handle,
            body,
            async_data,
            input_len: input.len() as u32,
            reply_cap: reply_cap as u32,
        };
        let frame = match protocol::encode_request(&header, input) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "request encoding failed");
                return self.failed_reply(NtStatus::INVALID_PARAMETER);
            }
        };
        let reply = match self.transport.round_trip(frame).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "service round trip failed");
                return self.failed_reply(NtStatus::PIPE_DISCONNECTED);
            }
        };
        let (header, data): (ReplyHeader, Bytes) = match protocol::decode_reply(&reply) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "reply decoding failed");
                return self.failed_reply(NtStatus::PIPE_DISCONNECTED);
            }
        };
        ServerReply {
            status: header.status,
            data,
            size_hint: header.size_hint as usize,
            options: header.options,
            wait: (header.wait != 0).then(|| self.wait_handle(header.wait)),
        }
    }

    fn failed_reply(&self, status: NtStatus) -> ServerReply {
        ServerReply {
            status,
            data: Bytes::new(),
            size_hint: 0,
            options: 0,
            wait: None,
        }
    }

    /// Issue an operation that may defer. The completion block is parked before
    /// the request leaves, so a completion event racing the reply still finds
    /// it. On a terminal reply the block is finished here and the reply payload
    /// returned; on `PENDING` the block stays parked for the dispatcher.
    pub async fn call_async(
        &self,
        handle: u64,
        body: RequestBody,
        input: &[u8],
        reply_cap: usize,
        io: Box<AsyncIo>,
    ) -> ServerReply {
        let user = self.next_user.fetch_add(1, Ordering::Relaxed);
        let async_data = AsyncData {
            handle,
            user,
            iosb: iosb_id(&io.iosb),
            event: 0,
        };
        self.pending_lock().insert(
            user,
            PendingEntry {
                io,
                wait_cookie: None,
            },
        );

        let reply = self
            .call_inner(handle, body, Some(async_data), input, reply_cap)
            .await;

        if reply.status == NtStatus::PENDING {
            let mut pending = self.pending_lock();
            match pending.get_mut(&user) {
                Some(entry) => {
                    entry.wait_cookie = reply.wait.as_ref().map(|w| w.cookie);
                }
                None => {
                    // Completion event beat the reply; the waiter must not
                    // block on a signal nobody will send.
                    drop(pending);
                    if let Some(wait) = &reply.wait {
                        self.signal(wait.cookie);
                    }
                }
            }
            return reply;
        }

        // Terminal reply: the operation never parked server-side.
        if let Some(entry) = self.pending_lock().remove(&user) {
            let information = reply.data.len();
            entry
                .io
                .finish(&self.pool, reply.status, information, reply.data.clone());
        } else {
            warn!(user, "terminal reply for an already-completed operation");
        }
        reply
    }

    /// Block until a server wait cookie fires, then report the operation's
    /// recorded outcome. An alert during an alertable wait returns `PENDING`
    /// without consuming the wake.
    pub async fn wait_async(
        &self,
        wait: WaitHandle,
        alertable: bool,
        iosb: &Arc<IoStatusBlock>,
    ) -> NtStatus {
        if alertable {
            tokio::select! {
                _ = wait.notify.notified() => {}
                _ = self.alert.notified() => {
                    trace!(cookie = wait.cookie, "alertable wait interrupted");
                    return NtStatus::PENDING;
                }
            }
        } else {
            wait.notify.notified().await;
        }
        iosb.status()
    }

    /// Block until a wait cookie fires, with no operation outcome attached.
    pub async fn wait(&self, wait: WaitHandle) {
        wait.notify.notified().await;
    }

    /// Deliver an alert to the next alertable waiter.
    pub fn alert(&self) {
        self.alert.notify_one();
    }

    /// Cancel in-flight asynchronous operations on a handle: all of the
    /// caller's operations, or only those matching one I/O status block.
    pub async fn cancel_io(&self, handle: u64, iosb: Option<&Arc<IoStatusBlock>>) -> NtStatus {
        let body = RequestBody::CancelAsync {
            iosb: iosb.map(iosb_id).unwrap_or(0),
            only_thread: iosb.is_none(),
        };
        self.call(handle, body, &[], 0).await.status
    }

    async fn dispatch_events(self: Arc<Self>) {
        while let Some(event) = self.transport.next_event().await {
            match event {
                ServerEvent::Completion {
                    user,
                    status,
                    information,
                } => self.complete(user, status, information as usize).await,
                ServerEvent::Signal { cookie } => self.signal(cookie),
            }
        }
        debug!("event stream closed, failing parked operations");
        let parked: Vec<PendingEntry> = {
            let mut pending = self.pending_lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in parked {
            let cookie = entry.wait_cookie;
            entry
                .io
                .finish(&self.pool, NtStatus::PIPE_DISCONNECTED, 0, Bytes::new());
            if let Some(cookie) = cookie {
                self.signal(cookie);
            }
        }
    }

    /// Resolve one parked operation. `ALERTED` means the outcome is ready but
    /// must be fetched with a follow-up call; anything else is final as-is.
    async fn complete(&self, user: u64, status: NtStatus, information: usize) {
        let entry = match self.pending_lock().remove(&user) {
            Some(entry) => entry,
            None => {
                warn!(user, "completion event for unknown operation");
                return;
            }
        };
        let handle = entry.io.handle;
        let (status, information, payload) = match &entry.io.kind {
            AioKind::Irp { buffer } => {
                if status == NtStatus::ALERTED {
                    let reply = self
                        .call(handle, RequestBody::GetAsyncResult { user }, &[], buffer.len())
                        .await;
                    let len = reply.data.len();
                    (reply.status, len, reply.data)
                } else {
                    (status, information, Bytes::new())
                }
            }
            AioKind::ReadChanges {
                data_size,
                out_cap,
                want_data,
            } => {
                crate::notify::complete_watch(self, handle, *data_size, *out_cap, *want_data, status)
                    .await
            }
            AioKind::Read { count } => (status, information.min(*count), Bytes::new()),
            AioKind::Write { count } => (status, information.min(*count), Bytes::new()),
        };
        trace!(user, handle, ?status, information, "operation completed");
        entry.io.finish(&self.pool, status, information, payload);
        if let Some(cookie) = entry.wait_cookie {
            self.signal(cookie);
        }
    }

    fn signal(&self, cookie: u64) {
        self.wait_signal(cookie).notify_one();
    }

    #[cfg(test)]
    fn registered_waits(&self) -> usize {
        self.waits.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
