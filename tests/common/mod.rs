//! Shared test fixtures: a scripted in-process transport standing in for the
//! coordination service.

use async_trait::async_trait;
use bytes::Bytes;
use libntio::server::protocol::{
    self, ReplyHeader, RequestBody, RequestHeader, ServerEvent,
};
use libntio::server::transport::{Transport, TransportError};
use libntio::status::NtStatus;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What the scripted service answers for one request.
pub struct MockReply {
    pub status: NtStatus,
    pub wait: u64,
    pub options: u32,
    pub size_hint: u32,
    pub data: Vec<u8>,
}

impl MockReply {
    pub fn status(status: NtStatus) -> MockReply {
        MockReply {
            status,
            wait: 0,
            options: 0,
            size_hint: 0,
            data: Vec::new(),
        }
    }

    pub fn with_data(status: NtStatus, data: Vec<u8>) -> MockReply {
        MockReply {
            data,
            ..MockReply::status(status)
        }
    }

    pub fn pending(wait: u64, options: u32) -> MockReply {
        MockReply {
            wait,
            options,
            ..MockReply::status(NtStatus::PENDING)
        }
    }

    pub fn overflow(size_hint: u32) -> MockReply {
        MockReply {
            size_hint,
            ..MockReply::status(NtStatus::BUFFER_OVERFLOW)
        }
    }
}

/// Per-request script: receives the decoded request, its input segment, and a
/// sender for injecting out-of-band events.
pub type Responder = Box<
    dyn Fn(&RequestHeader, &[u8], &mpsc::UnboundedSender<ServerEvent>) -> MockReply + Send + Sync,
>;

pub struct MockTransport {
    responder: Responder,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
    calls: Mutex<Vec<RequestBody>>,
}

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl MockTransport {
    pub fn new(responder: Responder) -> Arc<MockTransport> {
        init_tracing();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(MockTransport {
            responder,
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RequestBody> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, pred: impl Fn(&RequestBody) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|b| pred(b)).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn round_trip(&self, frame: Bytes) -> Result<Bytes, TransportError> {
        let (header, input) = protocol::decode_request(&frame)?;
        self.calls.lock().unwrap().push(header.body.clone());
        let reply = (self.responder)(&header, &input, &self.events_tx);
        let data_len = reply.data.len().min(header.reply_cap as usize);
        let encoded = protocol::encode_reply(
            &ReplyHeader {
                status: reply.status,
                wait: reply.wait,
                options: reply.options,
                size_hint: reply.size_hint,
                output_len: data_len as u32,
            },
            &reply.data[..data_len],
        )?;
        Ok(encoded)
    }

    async fn next_event(&self) -> Option<ServerEvent> {
        self.events_rx.lock().await.recv().await
    }
}
