//! Directory watch establishment and record conversion end to end.

mod common;

use common::{MockReply, MockTransport};
use libntio::aio::AioPool;
use libntio::config::Config;
use libntio::handle::FileHandle;
use libntio::notify::{self, ACTION_ADDED, ACTION_REMOVED, NotifyFilter};
use libntio::server::ServerClient;
use libntio::server::protocol::{RequestBody, ServerEvent};
use libntio::status::{IoStatusBlock, NtStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

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

/// Scripts a watch that wakes immediately with the given raw batch.
fn watch_transport(batch: Vec<u8>) -> Arc<MockTransport> {
    MockTransport::new(Box::new(move |header, _, events| match &header.body {
        RequestBody::ReadDirectoryChanges { .. } => {
            let user = header.async_data.expect("watch must carry async data").user;
            events
                .send(ServerEvent::Completion {
                    user,
                    status: NtStatus::ALERTED,
                    information: 0,
                })
                .unwrap();
            MockReply::pending(0, 0)
        }
        RequestBody::ReadChange => MockReply::with_data(NtStatus::SUCCESS, batch.clone()),
        other => panic!("unexpected request: {other:?}"),
    }))
}

#[tokio::test]
async fn invalid_filters_never_reach_the_service() {
    let transport = MockTransport::new(Box::new(|_, _, _| MockReply::status(NtStatus::SUCCESS)));
    let client = ServerClient::new(transport.clone(), AioPool::new(16));
    let config = Config::default();
    let handle = FileHandle::new(1, None);

    let status = notify::read_directory_changes(
        &client,
        &config,
        &handle,
        IoStatusBlock::new(),
        4096,
        0,
        false,
        Box::new(|_, _| {}),
    )
    .await;
    assert_eq!(status, NtStatus::INVALID_PARAMETER);

    let status = notify::read_directory_changes(
        &client,
        &config,
        &handle,
        IoStatusBlock::new(),
        4096,
        0x8000_0000,
        false,
        Box::new(|_, _| {}),
    )
    .await;
    assert_eq!(status, NtStatus::INVALID_PARAMETER);

    // 0x80 sits inside the low filter byte but names no event class.
    let status = notify::read_directory_changes(
        &client,
        &config,
        &handle,
        IoStatusBlock::new(),
        4096,
        0x80,
        false,
        Box::new(|_, _| {}),
    )
    .await;
    assert_eq!(status, NtStatus::INVALID_PARAMETER);

    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn watch_delivers_converted_records() {
    let mut batch = raw_event(ACTION_ADDED, "sub/new.txt");
    batch.extend(raw_event(ACTION_REMOVED, "old"));
    let transport = watch_transport(batch);
    let client = ServerClient::new(transport.clone(), AioPool::new(16));
    let config = Config::default();
    let handle = FileHandle::new(4, None);
    let iosb = IoStatusBlock::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let status = notify::read_directory_changes(
        &client,
        &config,
        &handle,
        iosb.clone(),
        4096,
        NotifyFilter::FILE_NAME.bits(),
        true,
        Box::new(move |status, payload| {
            tx.send((status, payload)).unwrap();
        }),
    )
    .await;
    assert!(status == NtStatus::PENDING || status == NtStatus::SUCCESS);

    let (status, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("watch completion timed out")
        .expect("callback dropped");
    assert_eq!(status, NtStatus::SUCCESS);
    assert_eq!(iosb.status(), NtStatus::SUCCESS);
    assert_eq!(iosb.information(), payload.len());

    let decoded: Vec<_> = notify::records(&payload).collect();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].action, ACTION_ADDED);
    assert_eq!(decoded[0].name, "sub\\new.txt");
    assert_eq!(decoded[1].action, ACTION_REMOVED);
    assert_eq!(decoded[1].name, "old");
}

#[tokio::test]
async fn overflowing_batch_reports_a_rescan_not_a_partial_view() {
    let mut batch = raw_event(ACTION_ADDED, "short");
    batch.extend(raw_event(ACTION_ADDED, "a-much-longer-name-that-overflows"));
    let transport = watch_transport(batch);
    let client = ServerClient::new(transport.clone(), AioPool::new(16));
    let config = Config::default();
    let handle = FileHandle::new(4, None);
    let iosb = IoStatusBlock::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    notify::read_directory_changes(
        &client,
        &config,
        &handle,
        iosb.clone(),
        32, // holds the first record only
        NotifyFilter::FILE_NAME.bits() | NotifyFilter::DIR_NAME.bits(),
        false,
        Box::new(move |status, payload| {
            tx.send((status, payload)).unwrap();
        }),
    )
    .await;

    let (status, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("watch completion timed out")
        .expect("callback dropped");
    assert_eq!(status, NtStatus::NOTIFY_ENUM_DIR);
    assert!(payload.is_empty());
    assert_eq!(iosb.status(), NtStatus::NOTIFY_ENUM_DIR);
    assert_eq!(iosb.information(), 0);
}

#[tokio::test]
async fn watch_without_a_buffer_still_wakes_with_a_rescan() {
    let batch = raw_event(ACTION_ADDED, "x");
    let transport = watch_transport(batch);
    let client = ServerClient::new(transport.clone(), AioPool::new(16));
    let config = Config::default();
    let handle = FileHandle::new(4, None);
    let iosb = IoStatusBlock::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    notify::read_directory_changes(
        &client,
        &config,
        &handle,
        iosb.clone(),
        0,
        NotifyFilter::LAST_WRITE.bits(),
        false,
        Box::new(move |status, payload| {
            tx.send((status, payload)).unwrap();
        }),
    )
    .await;

    let (status, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("watch completion timed out")
        .expect("callback dropped");
    assert_eq!(status, NtStatus::NOTIFY_ENUM_DIR);
}

#[tokio::test]
async fn failed_batch_fetch_degrades_to_a_rescan() {
    let transport = MockTransport::new(Box::new(move |header, _, events| match &header.body {
        RequestBody::ReadDirectoryChanges { .. } => {
            let user = header.async_data.unwrap().user;
            events
                .send(ServerEvent::Completion {
                    user,
                    status: NtStatus::ALERTED,
                    information: 0,
                })
                .unwrap();
            MockReply::pending(0, 0)
        }
        RequestBody::ReadChange => MockReply::status(NtStatus::ACCESS_DENIED),
        other => panic!("unexpected request: {other:?}"),
    }));
    let client = ServerClient::new(transport.clone(), AioPool::new(16));
    let config = Config::default();
    let handle = FileHandle::new(4, None);
    let iosb = IoStatusBlock::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    notify::read_directory_changes(
        &client,
        &config,
        &handle,
        iosb.clone(),
        4096,
        NotifyFilter::FILE_NAME.bits(),
        false,
        Box::new(move |status, payload| {
            tx.send((status, payload)).unwrap();
        }),
    )
    .await;

    // The events are lost with the fetch, so the caller is told to rescan
    // rather than handed the raw service error.
    let (status, payload) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("completion timed out")
        .expect("callback dropped");
    assert_eq!(status, NtStatus::NOTIFY_ENUM_DIR);
    assert!(payload.is_empty());
    assert_eq!(iosb.status(), NtStatus::NOTIFY_ENUM_DIR);
    assert_eq!(transport.count_calls(|b| matches!(b, RequestBody::ReadChange)), 1);
}

#[tokio::test]
async fn cancelled_watch_passes_the_status_through() {
    let transport = MockTransport::new(Box::new(move |header, _, events| match &header.body {
        RequestBody::ReadDirectoryChanges { .. } => {
            let user = header.async_data.unwrap().user;
            events
                .send(ServerEvent::Completion {
                    user,
                    status: NtStatus::CANCELLED,
                    information: 0,
                })
                .unwrap();
            MockReply::pending(0, 0)
        }
        other => panic!("unexpected request: {other:?}"),
    }));
    let client = ServerClient::new(transport.clone(), AioPool::new(16));
    let config = Config::default();
    let handle = FileHandle::new(4, None);
    let iosb = IoStatusBlock::new();

    let (tx, mut rx) = mpsc::unbounded_channel();
    notify::read_directory_changes(
        &client,
        &config,
        &handle,
        iosb.clone(),
        4096,
        NotifyFilter::FILE_NAME.bits(),
        false,
        Box::new(move |status, payload| {
            tx.send((status, payload)).unwrap();
        }),
    )
    .await;

    let (status, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("completion timed out")
        .expect("callback dropped");
    assert_eq!(status, NtStatus::CANCELLED);
    // No fetch happens for a cancelled watch.
    assert_eq!(transport.count_calls(|b| matches!(b, RequestBody::ReadChange)), 0);
}
