mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::unbounded_channel;

use streamload::{Client, ClientContext, ClientOptions, Status, Subscription, Transport};

use common::{eventually, within, Behavior, MockServer};

async fn run_counting_session(options: ClientOptions, url_scheme: &str, transport: Transport) {
    let (addr, server) = MockServer::start(Behavior::default()).await;
    let ctx = ClientContext::new(options).unwrap();

    let session = Client::new(ctx.clone(), format!("{}://{}", url_scheme, addr), "DEMO")
        .with_transport(transport)
        .connect()
        .unwrap();

    let updates = Arc::new(AtomicUsize::new(0));
    let counted = updates.clone();
    let (subscribed_tx, mut subscribed) = unbounded_channel();

    let subscription = Subscription::new("MERGE")
        .with_items(["i1"])
        .with_fields(["f1", "f2", "f3", "f4"])
        .on_subscription(move |items, fields| {
            let _ = subscribed_tx.send((items, fields));
        })
        .on_item_update(move |_| {
            counted.fetch_add(1, Ordering::Relaxed);
        });

    within(session.subscribe(subscription)).await.unwrap();

    // No SUBOK is ever decoded, the acknowledgement is synthesized.
    assert_eq!(within(subscribed.recv()).await, Some((-1, -1)));

    let stats = ctx.stats().clone();
    eventually(|| stats.bytes_read.get() > 0).await;
    eventually(|| {
        server
            .requests("control")
            .iter()
            .chain(server.requests("ws:control").iter())
            .count()
            == 1
    })
    .await;

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.bind_done, 1);
    assert_eq!(snapshot.sub_done, 1);
    assert_eq!(updates.load(Ordering::Relaxed), 0);
    assert_ne!(session.status(), Status::Disconnected);

    within(session.disconnect()).await.unwrap();
}

#[tokio::test]
async fn test_http_ignore_data() {
    let options = ClientOptions {
        ignore_data: true,
        ..Default::default()
    };
    run_counting_session(options, "http", Transport::HttpStreaming).await;
}

#[tokio::test]
async fn test_ws_ignore_data() {
    let options = ClientOptions {
        ignore_data: true,
        ..Default::default()
    };
    run_counting_session(options, "ws", Transport::WsStreaming).await;
}

#[tokio::test]
async fn test_raw_socket() {
    let options = ClientOptions {
        raw_socket: true,
        ..Default::default()
    };
    run_counting_session(options, "ws", Transport::WsStreaming).await;
}
