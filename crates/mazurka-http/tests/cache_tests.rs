//! Response caching: capture, replay, conditionals, client headers.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::TestServer;
use mazurka_http::cache::CacheProfile;
use mazurka_http::router::Route;

fn cached_server(profile: CacheProfile) -> (TestServer, Arc<AtomicUsize>) {
    let server = TestServer::new();
    let mut route = Route::new("gen", "^/gen$");
    route.set_handler("action");
    route.add_cache_profile(profile);
    server.add_route(route);

    let generation = Arc::new(AtomicUsize::new(0));
    let counter = generation.clone();
    server.http.define_action("/gen", move |conn| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let body = format!("gen-{n}");
        conn.tx.mime_type = Some("text/plain".into());
        conn.tx.etag = Some(format!("g{n}"));
        conn.tx.length = body.len() as i64;
        conn.write(body.into_bytes())?;
        conn.finalize_output();
        Ok(())
    });
    (server, generation)
}

#[test]
fn server_cache_captures_then_replays() {
    let (server, generation) = cached_server(CacheProfile {
        lifespan: Duration::from_secs(60),
        ..Default::default()
    });

    let first = server.exchange(b"GET /gen HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(first.status, 200);
    let first_body = first.body_text();

    let second = server.exchange(b"GET /gen HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(second.status, 200);
    assert_eq!(second.body_text(), first_body, "replay must match the capture");
    assert_eq!(second.header("content-type"), Some("text/plain"));
    assert_eq!(generation.load(Ordering::SeqCst), 1, "handler must not rerun");
}

#[test]
fn cached_entry_answers_conditional_with_304() {
    let (server, _generation) = cached_server(CacheProfile {
        lifespan: Duration::from_secs(60),
        ..Default::default()
    });

    let first = server.exchange(b"GET /gen HTTP/1.1\r\nHost: x\r\n\r\n");
    let etag = first.header("etag").unwrap().to_string();

    let raw = format!("GET /gen HTTP/1.1\r\nHost: x\r\nIf-None-Match: {etag}\r\n\r\n");
    let second = server.exchange(raw.as_bytes());
    assert_eq!(second.status, 304);
    assert!(second.body.is_empty());
}

#[test]
fn client_mode_emits_cache_control_and_expires() {
    let (server, _generation) = cached_server(CacheProfile {
        lifespan: Duration::from_secs(60),
        client_lifespan: Some(Duration::from_secs(120)),
        ..Default::default()
    });

    let response = server.exchange(b"GET /gen HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.header("cache-control"), Some("public, max-age=120"));
    assert!(response.header("expires").is_some());
}

#[test]
fn query_sensitive_profile_keys_on_query() {
    let (server, _generation) = cached_server(CacheProfile {
        lifespan: Duration::from_secs(60),
        unique: true,
        ..Default::default()
    });

    let a = server.exchange(b"GET /gen?v=1 HTTP/1.1\r\nHost: x\r\n\r\n");
    let b = server.exchange(b"GET /gen?v=2 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_ne!(a.body_text(), b.body_text(), "different queries, different entries");

    let a_again = server.exchange(b"GET /gen?v=1 HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(a_again.body_text(), a.body_text());
}

#[test]
fn post_not_cached_by_default() {
    let (server, _generation) = cached_server(CacheProfile {
        lifespan: Duration::from_secs(60),
        ..Default::default()
    });

    let first =
        server.exchange(b"POST /gen HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n");
    let second =
        server.exchange(b"POST /gen HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n");
    assert_ne!(first.body_text(), second.body_text());
}

#[test]
fn manual_profile_skips_automatic_capture() {
    let (server, generation) = cached_server(CacheProfile {
        lifespan: Duration::from_secs(60),
        manual: true,
        ..Default::default()
    });

    server.exchange(b"GET /gen HTTP/1.1\r\nHost: x\r\n\r\n");
    server.exchange(b"GET /gen HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(generation.load(Ordering::SeqCst), 2);
    assert!(server.host.cache.is_empty());
}

#[test]
fn manual_store_api_round_trips() {
    use mazurka_http::cache::CachedResponse;
    use std::time::Instant;

    let server = TestServer::new();
    server.host.cache.update(
        "http::response::/manual",
        CachedResponse {
            status: 200,
            mime_type: Some("text/plain".into()),
            etag: None,
            modified: None,
            body: b"manual".to_vec(),
            stored: Instant::now(),
            lifespan: Duration::from_secs(60),
        },
    );
    let entry = server.host.cache.lookup("http::response::/manual").unwrap();
    assert_eq!(entry.body, b"manual");
    assert!(server.host.cache.remove("http::response::/manual"));
    assert!(server.host.cache.lookup("http::response::/manual").is_none());
}
