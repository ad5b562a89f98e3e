//! HttpOrigin against a minimal local HTTP/1.1 responder.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use edgecache_config::testing::TestEnvironment;
use edgecache_fetch::{
    CacheController, CacheOutcome, CacheRequest, FetchSettings, HttpOrigin, Origin, OriginSettings,
};
use edgecache_store::{CacheStore, ConcurrencyGuard, DiskAdmission, FixedSpace, HttpValidators, StorePaths};

/// Serve each canned response to one connection, recording request heads.
async fn serve(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            log.lock()
                .unwrap()
                .push(String::from_utf8_lossy(&head).to_lowercase());
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        }
    });

    (format!("http://{}", addr), seen)
}

fn ok(body: &str, etag: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nETag: {}\r\nLast-Modified: Wed, 21 Oct 2015 07:28:00 GMT\r\nConnection: close\r\n\r\n{}",
        body.len(),
        etag,
        body
    )
}

fn not_modified() -> String {
    "HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n".to_string()
}

#[tokio::test]
async fn test_get_reads_status_validators_and_body() {
    let (base, _) = serve(vec![ok("hello origin", "\"abc\"")]).await;
    let origin = HttpOrigin::new(&OriginSettings::default()).unwrap();

    let response = origin.get(&format!("{}/a.txt", base), None).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.etag.as_deref(), Some("\"abc\""));
    assert_eq!(
        response.last_modified.as_deref(),
        Some("Wed, 21 Oct 2015 07:28:00 GMT")
    );
    assert_eq!(response.content_length, Some(12));

    let mut body = Vec::new();
    let mut stream = response.body;
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body, b"hello origin");
}

#[tokio::test]
async fn test_etag_is_preferred_over_last_modified() {
    let (base, seen) = serve(vec![not_modified(), not_modified()]).await;
    let origin = HttpOrigin::new(&OriginSettings::default()).unwrap();

    let both = HttpValidators::new(
        Some("\"abc\"".into()),
        Some("Wed, 21 Oct 2015 07:28:00 GMT".into()),
    );
    let response = origin.get(&format!("{}/a", base), Some(&both)).await.unwrap();
    assert_eq!(response.status, 304);

    let date_only = HttpValidators::new(None, Some("Wed, 21 Oct 2015 07:28:00 GMT".into()));
    origin.get(&format!("{}/a", base), Some(&date_only)).await.unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen[0].contains("if-none-match: \"abc\""));
    assert!(!seen[0].contains("if-modified-since"));
    assert!(seen[1].contains("if-modified-since: wed, 21 oct 2015 07:28:00 gmt"));
    assert!(!seen[1].contains("if-none-match"));
}

#[tokio::test]
async fn test_unreachable_origin_is_an_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let origin = HttpOrigin::new(&OriginSettings {
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    })
    .unwrap();
    assert!(origin.get(&format!("http://{}/x", addr), None).await.is_err());
}

#[tokio::test]
async fn test_controller_end_to_end_over_http() {
    let (base, seen) = serve(vec![ok("payload", "\"v1\""), not_modified()]).await;
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(
        CacheStore::open(&StorePaths {
            cache_dir: env.cache_dir.clone(),
            staging_dir: env.staging_dir.clone(),
            meta_dir: env.meta_dir.clone(),
        })
        .unwrap(),
    );
    let controller = CacheController::new(
        store.clone(),
        Arc::new(DiskAdmission::new(Arc::new(FixedSpace::new(u64::MAX / 2)))),
        Arc::new(ConcurrencyGuard::default()),
        Arc::new(HttpOrigin::new(&OriginSettings::default()).unwrap()),
        FetchSettings {
            staleness: Duration::ZERO,
            ..Default::default()
        },
    );
    let url = format!("{}/feeds/data.json?callback=cb123", base);

    let first = controller.fetch(&CacheRequest::new(&url)).await;
    let CacheOutcome::Fetched(served) = first else {
        panic!("expected a fetch, got {:?}", first);
    };
    assert_eq!(served.read().await.unwrap(), b"payload");

    // Zero staleness window: every request revalidates.
    let second = controller.fetch(&CacheRequest::new(&url)).await;
    assert!(matches!(second, CacheOutcome::Revalidated(_)));
    assert!(seen.lock().unwrap()[1].contains("if-none-match: \"v1\""));
}
