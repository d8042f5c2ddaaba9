//! Per-operation asynchronous completion state and its recycling pool.
//!
//! Every operation that cannot complete synchronously gets one [`AsyncIo`]
//! block: a completion callback, a back-reference to the resource handle, the
//! shared I/O status block, and an operation-specific payload. Ownership is
//! exclusive and sequential — the block is handed to the coordination client,
//! parked while the request is in flight, and destroyed by whichever path
//! first observes a terminal status.

use crate::status::{IoStatusBlock, NtStatus};
use bytes::Bytes;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Completion callback, invoked exactly once with the terminal status and any
/// deferred payload (reply bytes for control operations, converted records for
/// a directory watch, empty otherwise).
pub type AioCallback = Box<dyn FnOnce(NtStatus, Bytes) + Send + 'static>;

/// Operation-specific payload of a completion block.
pub enum AioKind {
    /// Outstanding read: destination capacity, for bounding the deferred
    /// result fetch.
    Read { count: usize },
    /// Outstanding write: source byte count.
    Write { count: usize },
    /// Generic control operation: owned reply buffer, sized to the caller's
    /// output capacity.
    Irp { buffer: Vec<u8> },
    /// Directory watch: raw event ring plus the caller's output capacity.
    ReadChanges {
        data_size: usize,
        out_cap: usize,
        want_data: bool,
    },
}

/// State for one outstanding asynchronous operation.
pub struct AsyncIo {
    /// Intrusive free-list link; only touched while the block is owned by the
    /// pool's free list.
    next: *mut AsyncIo,
    pub handle: u64,
    pub iosb: Arc<IoStatusBlock>,
    callback: Option<AioCallback>,
    pub kind: AioKind,
}

// The raw `next` pointer is dormant outside the free list; every other field
// is Send. Blocks move between the issuing task and the completion task but
// are never shared.
unsafe impl Send for AsyncIo {}

impl AsyncIo {
    /// Publish the terminal outcome: fill the I/O status block, then fire the
    /// callback. Consuming `self` by box makes a second completion a
    /// compile-time error.
    pub fn finish(mut self: Box<Self>, pool: &AioPool, status: NtStatus, information: usize, payload: Bytes) {
        debug_assert!(status.is_terminal());
        self.iosb.set(status, information);
        if let Some(cb) = self.callback.take() {
            cb(status, payload);
        }
        pool.release(self);
    }
}

/// Recycler for completion blocks.
///
/// Released blocks are pushed onto a lock-free single-linked list and actually
/// freed on the next acquisition; no block is ever reused. This keeps release
/// wait-free from any completion context while avoiding a long-lived free list.
pub struct AioPool {
    freelist: AtomicPtr<AsyncIo>,
    outstanding: AtomicUsize,
    limit: usize,
}

impl AioPool {
    pub fn new(limit: usize) -> Arc<AioPool> {
        Arc::new(AioPool {
            freelist: AtomicPtr::new(ptr::null_mut()),
            outstanding: AtomicUsize::new(0),
            limit,
        })
    }

    /// Allocate a fresh completion block, first freeing everything parked on
    /// the free list. Reports `NO_MEMORY` when the outstanding-operation bound
    /// is reached; exhaustion is never silent.
    pub fn acquire(
        &self,
        kind: AioKind,
        callback: AioCallback,
        handle: u64,
        iosb: Arc<IoStatusBlock>,
    ) -> Result<Box<AsyncIo>, NtStatus> {
        self.drain();

        let mut n = self.outstanding.load(Ordering::Relaxed);
        loop {
            if n >= self.limit {
                tracing::warn!(limit = self.limit, "completion pool exhausted");
                return Err(NtStatus::NO_MEMORY);
            }
            match self.outstanding.compare_exchange_weak(
                n,
                n + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(cur) => n = cur,
            }
        }

        Ok(Box::new(AsyncIo {
            next: ptr::null_mut(),
            handle,
            iosb,
            callback: Some(callback),
            kind,
        }))
    }

    /// Park a finished block for deferred freeing. Wait-free: a single
    /// compare-and-swap loop, callable from any thread.
    pub fn release(&self, io: Box<AsyncIo>) {
        let raw = Box::into_raw(io);
        let mut head = self.freelist.load(Ordering::Acquire);
        loop {
            // Safety: we exclusively own `raw` until the CAS below publishes it.
            unsafe { (*raw).next = head };
            match self
                .freelist
                .compare_exchange_weak(head, raw, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Detach the whole free list and free it. The exchange gives this thread
    /// exclusive ownership of every node, so plain pointer walks are safe.
    fn drain(&self) {
        let mut p = self.freelist.swap(ptr::null_mut(), Ordering::AcqRel);
        while !p.is_null() {
            // Safety: nodes on the detached list are owned solely by us.
            let boxed = unsafe { Box::from_raw(p) };
            p = boxed.next;
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl Drop for AioPool {
    fn drop(&mut self) {
        self.drain();
    }
}
