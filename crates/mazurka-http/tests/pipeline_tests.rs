//! Pipeline mechanics: watermark invariants, partial writes, large
//! bodies through the full chain.

mod common;

use common::{TestServer, parse_response};
use mazurka_http::router::Route;
use mazurka_http::stage::Dir;

#[test]
fn queue_counts_match_queued_payloads_at_yield_points() {
    let docs = tempfile::tempdir().unwrap();
    let body: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(docs.path().join("big.bin"), &body).unwrap();
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(docs.path()));

    let (mut conn, handle) = server.open(b"GET /big.bin HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    handle.set_write_cap(777);
    conn.io_event(true, false);

    // At every dispatcher yield the invariant must hold for all queues.
    for _ in 0..200 {
        for queue in conn.pipeline.queues.iter() {
            let total: usize = queue.packets.iter().map(|p| p.len()).sum();
            assert_eq!(queue.count, total, "queue count invariant broken");
        }
        if conn.tx.finalized_connector {
            break;
        }
        conn.io_event(false, true);
    }
    assert!(conn.tx.finalized_connector, "response should complete");

    let response = parse_response(&handle.output());
    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), body.len());
    assert_eq!(response.body, body);
}

#[test]
fn large_action_response_flows_with_backpressure() {
    let server = TestServer::new();
    let mut route = Route::new("big", "^/big$");
    route.set_handler("action");
    server.add_route(route);
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
    let expected = payload.clone();
    server.http.define_action("/big", move |conn| {
        conn.tx.length = payload.len() as i64;
        conn.write(payload.clone())?;
        conn.finalize_output();
        Ok(())
    });

    let (mut conn, handle) = server.open(b"GET /big HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    handle.set_write_cap(1234);
    conn.io_event(true, false);
    for _ in 0..500 {
        if conn.tx.finalized_connector {
            break;
        }
        conn.io_event(false, true);
    }
    let response = parse_response(&handle.output());
    assert_eq!(response.body, expected);
}

#[test]
fn pipeline_pairs_stages_present_on_both_sides() {
    let docs = tempfile::tempdir().unwrap();
    std::fs::write(docs.path().join("a.txt"), b"x").unwrap();
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(docs.path()));

    let (mut conn, handle) = server.open(b"GET /a.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    conn.io_event(true, false);
    let _ = handle;

    // The handler appears in both directions and the queues point at
    // each other.
    let paired: Vec<_> = conn
        .pipeline
        .queues
        .iter()
        .enumerate()
        .filter(|(_, q)| q.pair.is_some())
        .collect();
    assert!(!paired.is_empty(), "handler queues should be paired");
    for (id, queue) in paired {
        let partner = queue.pair.unwrap();
        assert_eq!(conn.pipeline.queues[partner].pair, Some(id));
        assert_ne!(conn.pipeline.queues[partner].dir, queue.dir);
    }
}

#[test]
fn connector_queue_watermark_is_doubled() {
    let docs = tempfile::tempdir().unwrap();
    std::fs::write(docs.path().join("a.txt"), b"x").unwrap();
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(docs.path()));

    let (mut conn, _handle) = server.open(b"GET /a.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    conn.io_event(true, false);

    let base = conn.limits.queue_max;
    let connector = conn.pipeline.tx_tail.unwrap();
    assert_eq!(conn.pipeline.queues[connector].max, base * 2);
    let head = conn.pipeline.tx_head.unwrap();
    assert_eq!(conn.pipeline.queues[head].max, base);
}

#[test]
fn tx_queues_drain_completely_after_completion() {
    let docs = tempfile::tempdir().unwrap();
    std::fs::write(docs.path().join("a.txt"), b"abc").unwrap();
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(docs.path()));

    let (mut conn, _handle) = server.open(b"GET /a.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    conn.io_event(true, false);
    for queue in conn.pipeline.queues.iter().filter(|q| q.dir == Dir::Tx) {
        assert!(queue.is_drained());
        assert_eq!(queue.count, 0);
    }
}
