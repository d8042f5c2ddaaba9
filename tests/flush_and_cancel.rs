//! Flush and cancellation paths.

mod common;

use common::{MockReply, MockTransport};
use libntio::aio::AioPool;
use libntio::file;
use libntio::handle::FileHandle;
use libntio::server::ServerClient;
use libntio::server::protocol::{RequestBody, ServerEvent};
use libntio::status::{IoStatusBlock, NtStatus};
use std::os::fd::AsRawFd;
use std::sync::Arc;

fn client_with(transport: &Arc<MockTransport>) -> Arc<ServerClient> {
    ServerClient::new(transport.clone(), AioPool::new(16))
}

#[tokio::test]
async fn local_descriptors_flush_without_the_service() {
    let transport = MockTransport::new(Box::new(|_, _, _| {
        panic!("local flush must not reach the service")
    }));
    let client = client_with(&transport);

    let file_backing = tempfile::NamedTempFile::new().unwrap();
    let handle = FileHandle::new(1, Some(file_backing.as_file().as_raw_fd()));

    let status = file::flush_buffers(&client, &handle).await;
    assert_eq!(status, NtStatus::SUCCESS);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn service_objects_flush_through_the_service_and_wait() {
    let transport = MockTransport::new(Box::new(|header, _, events| match &header.body {
        RequestBody::Flush => {
            let user = header.async_data.unwrap().user;
            events
                .send(ServerEvent::Completion {
                    user,
                    status: NtStatus::SUCCESS,
                    information: 0,
                })
                .unwrap();
            MockReply::pending(3, 0)
        }
        other => panic!("unexpected request: {other:?}"),
    }));
    let client = client_with(&transport);
    let handle = FileHandle::new(6, None);

    let status = file::flush_buffers(&client, &handle).await;
    assert_eq!(status, NtStatus::SUCCESS);
    assert_eq!(transport.count_calls(|b| matches!(b, RequestBody::Flush)), 1);
}

#[tokio::test]
async fn cancel_variants_address_different_scopes() {
    let transport = MockTransport::new(Box::new(|_, _, _| MockReply::status(NtStatus::SUCCESS)));
    let client = client_with(&transport);
    let handle = FileHandle::new(2, None);

    assert_eq!(file::cancel_io(&client, &handle).await, NtStatus::SUCCESS);
    let iosb = IoStatusBlock::new();
    assert_eq!(
        file::cancel_io_ex(&client, &handle, &iosb).await,
        NtStatus::SUCCESS
    );

    let calls = transport.calls();
    match (&calls[0], &calls[1]) {
        (
            RequestBody::CancelAsync {
                iosb: first,
                only_thread: true,
            },
            RequestBody::CancelAsync {
                iosb: second,
                only_thread: false,
            },
        ) => {
            assert_eq!(*first, 0);
            assert_ne!(*second, 0);
        }
        other => panic!("unexpected requests: {other:?}"),
    }
}
