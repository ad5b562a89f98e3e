//! Push channel against a local websocket server.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use edgecache_config::testing::TestEnvironment;
use edgecache_push::{
    ChannelState, InvalidationListener, PushChannel, PushMessage, PushSettings, ReconnectPolicy,
};
use edgecache_store::{
    unix_now, CacheStore, ConcurrencyGuard, HttpValidators, StorageObject, StorePaths,
};

fn settings(url: String) -> PushSettings {
    PushSettings {
        url,
        display_id: "D1".into(),
        machine_id: Some("M1".into()),
        reconnect: ReconnectPolicy {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: Duration::ZERO,
        },
        offline_grace: Duration::from_secs(5),
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_registrations_replay_and_updates_apply_across_reconnect() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(
        CacheStore::open(&StorePaths {
            cache_dir: env.cache_dir.clone(),
            staging_dir: env.staging_dir.clone(),
            meta_dir: env.meta_dir.clone(),
        })
        .unwrap(),
    );
    let object = StorageObject::for_company("abc", "img/a.png");
    let key = object.key();
    std::fs::write(store.path_in_cache(&key), b"cached").unwrap();
    store
        .meta()
        .save_validators(&key, HttpValidators::new(Some("\"e\"".into()), None), unix_now())
        .unwrap();

    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(usize, String)>();

    tokio::spawn(async move {
        // First connection: take the registration, then hang up.
        let (tcp, _) = server.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            seen_tx.send((1, text)).unwrap();
        }
        let _ = ws.close(None).await;
        drop(ws);

        // Second connection: expect the replay, then push an update.
        let (tcp, _) = server.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            seen_tx.send((2, text)).unwrap();
        }
        let update = r#"{"msg":"gcs-update","companyId":"abc","resource":"img/a.png","type":"deleted"}"#;
        ws.send(Message::Text(update.to_string())).await.unwrap();
        // Keep the connection open until the test ends.
        while ws.next().await.is_some() {}
    });

    let channel = Arc::new(PushChannel::new(settings(format!("ws://{}/messaging", addr))));
    let listener = Arc::new(InvalidationListener::new(
        store.clone(),
        Arc::new(ConcurrencyGuard::default()),
        channel.outbox(),
        Some("D1".into()),
        Duration::from_secs(5),
    ));
    assert!(listener.register_path("abc", "img/a.png"));

    let mut state = channel.state();
    let handle = channel.clone().spawn(listener.clone());

    let expected = PushMessage::register_path("abc", "img/a.png");
    let (conn, text) = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn, 1);
    assert_eq!(PushMessage::parse(&text).unwrap(), expected);

    let (conn, text) = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn, 2);
    assert_eq!(PushMessage::parse(&text).unwrap(), expected);

    // Deleted upstream: the cached file goes away.
    assert!(wait_for(|| !store.is_cached(&key)).await);
    // Reconnect after the first connection triggers one full resync.
    assert_eq!(listener.resync_count(), 1);

    tokio::time::timeout(Duration::from_secs(1), async {
        while *state.borrow_and_update() != ChannelState::Connected {
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    handle.abort();
}

#[tokio::test]
async fn test_unreachable_service_keeps_retrying() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(
        CacheStore::open(&StorePaths {
            cache_dir: env.cache_dir.clone(),
            staging_dir: env.staging_dir.clone(),
            meta_dir: env.meta_dir.clone(),
        })
        .unwrap(),
    );
    let channel = Arc::new(PushChannel::new(settings(format!("ws://{}/messaging", addr))));
    let listener = Arc::new(InvalidationListener::new(
        store,
        Arc::new(ConcurrencyGuard::default()),
        channel.outbox(),
        None,
        Duration::from_secs(5),
    ));

    let handle = channel.clone().spawn(listener.clone());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!handle.is_finished());
    assert_ne!(*channel.state().borrow(), ChannelState::Connected);
    // Registrations made while offline are kept for the next connection.
    assert!(listener.register_path("abc", "x.png"));
    assert_eq!(listener.registrations().len(), 1);
    handle.abort();
}
