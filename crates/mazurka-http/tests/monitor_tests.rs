//! Monitor counters driven by real request traffic, and the ban
//! defense end to end.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::TestServer;
use mazurka_http::monitor::{Counter, Relation};
use mazurka_http::trace::{Trace, TraceFormat};

#[test]
fn bad_requests_increment_counters() {
    let docs = tempfile::tempdir().unwrap();
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(docs.path()));

    server.exchange(b"GET\r\n\r\n");
    server.exchange(b"GET\r\n\r\n");
    let ip = "127.0.0.1".parse().unwrap();
    assert_eq!(server.http.monitor.address_counter(ip, Counter::BadRequestErrors), 2);
    assert!(server.http.monitor.global_counter(Counter::Errors) >= 2);
}

#[test]
fn not_found_increments_counter() {
    let docs = tempfile::tempdir().unwrap();
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(docs.path()));
    server.exchange(b"GET /ghost HTTP/1.1\r\nHost: x\r\n\r\n");
    let ip = "127.0.0.1".parse().unwrap();
    assert_eq!(server.http.monitor.address_counter(ip, Counter::NotFoundErrors), 1);
}

#[test]
fn eleven_bad_requests_trigger_ban() {
    let docs = tempfile::tempdir().unwrap();
    let trace_dir = tempfile::tempdir().unwrap();
    let trace_path = trace_dir.path().join("events.log");
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(docs.path()));
    server
        .http
        .set_trace(Trace::open(&trace_path, 5, TraceFormat::Detail, 0, 0, None).unwrap());
    server.http.monitor.set_trace(server.http.trace());

    server.http.monitor.add_defense(
        "blocker",
        "ban",
        HashMap::from([
            ("PERIOD".to_string(), "60".to_string()),
            ("STATUS".to_string(), "406".to_string()),
            ("MESSAGE".to_string(), "begone".to_string()),
        ]),
    );
    server.http.monitor.add_monitor(
        Counter::BadRequestErrors,
        Relation::Above,
        10,
        Duration::ZERO,
        &["blocker"],
    );

    for _ in 0..11 {
        let response = server.exchange(b"GET\r\n\r\n");
        assert_eq!(response.status, 400);
    }
    server.http.monitor.check_monitors();

    let ip = "127.0.0.1".parse().unwrap();
    let (status, message) = server.http.monitor.banned(ip).expect("address should be banned");
    assert_eq!(status, 406);
    assert_eq!(message, "begone");

    let log = std::fs::read_to_string(&trace_path).unwrap();
    assert!(log.contains("monitor.ban.start"), "ban start must be traced");
}

#[test]
fn requests_below_threshold_do_not_ban() {
    let docs = tempfile::tempdir().unwrap();
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(docs.path()));
    server.http.monitor.add_defense("blocker", "ban", HashMap::new());
    server.http.monitor.add_monitor(
        Counter::BadRequestErrors,
        Relation::Above,
        10,
        Duration::ZERO,
        &["blocker"],
    );
    for _ in 0..10 {
        server.exchange(b"GET\r\n\r\n");
    }
    server.http.monitor.check_monitors();
    let ip = "127.0.0.1".parse().unwrap();
    assert!(server.http.monitor.banned(ip).is_none());
}

#[test]
fn active_connection_gauge_rises_and_falls() {
    let docs = tempfile::tempdir().unwrap();
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(docs.path()));
    let ip = "127.0.0.1".parse().unwrap();

    let (conn, handle) = server.open(b"");
    assert_eq!(server.http.monitor.address_counter(ip, Counter::ActiveConnections), 1);
    drop(conn);
    drop(handle);
    assert_eq!(server.http.monitor.address_counter(ip, Counter::ActiveConnections), 0);
}

#[test]
fn delay_defense_records_per_address_delay() {
    let server = TestServer::new();
    let ip = "127.0.0.1".parse().unwrap();
    server.http.monitor.add_defense(
        "slow",
        "delay",
        HashMap::from([
            ("DELAY".to_string(), "2".to_string()),
            ("PERIOD".to_string(), "60".to_string()),
        ]),
    );
    server.http.monitor.add_monitor(
        Counter::Errors,
        Relation::Above,
        0,
        Duration::ZERO,
        &["slow"],
    );
    server.http.monitor.inc(Some(ip), Counter::Errors, 1);
    server.http.monitor.check_monitors();
    let delay = server.http.monitor.delay(ip).expect("delay should be active");
    assert_eq!(delay, Duration::from_secs(2));
}
