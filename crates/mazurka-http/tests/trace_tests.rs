//! The operational trace log observed through real request traffic.

mod common;

use common::TestServer;
use mazurka_http::trace::{Trace, TraceFormat};

fn traced_server(format: TraceFormat, level: u8) -> (tempfile::TempDir, std::path::PathBuf, TestServer) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("access.log");
    let docs = dir.path().join("docs");
    std::fs::create_dir(&docs).unwrap();
    std::fs::write(docs.join("page.txt"), b"traced").unwrap();

    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(&docs));
    server
        .http
        .set_trace(Trace::open(&path, level, format, 0, 0, None).unwrap());
    (dir, path, server)
}

#[test]
fn completion_renders_common_log_format() {
    let (_dir, path, server) = traced_server(TraceFormat::Common, 5);
    server.exchange(b"GET /page.txt HTTP/1.1\r\nHost: x\r\n\r\n");

    let log = std::fs::read_to_string(&path).unwrap();
    let line = log.lines().next().expect("access line missing");
    assert!(line.starts_with("127.0.0.1 - - ["), "unexpected line: {line}");
    assert!(line.contains("\"GET /page.txt HTTP/1.1\" 200 "));
}

#[test]
fn detail_format_records_request_lifecycle() {
    let (_dir, path, server) = traced_server(TraceFormat::Detail, 5);
    server.exchange(b"GET /page.txt HTTP/1.1\r\nHost: x\r\n\r\n");

    let log = std::fs::read_to_string(&path).unwrap();
    assert!(log.contains("request.start"));
    assert!(log.contains("rx.complete"));
    assert!(log.contains("method=GET"));
    assert!(log.contains("status=200"));
}

#[test]
fn json_format_emits_parsable_records() {
    let (_dir, path, server) = traced_server(TraceFormat::Json, 5);
    server.exchange(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");

    let log = std::fs::read_to_string(&path).unwrap();
    let mut saw_error = false;
    for line in log.lines() {
        let value: serde_json::Value = serde_json::from_str(line).expect("invalid json line");
        if value["event"] == "request.error" {
            assert_eq!(value["status"], "404");
            saw_error = true;
        }
    }
    assert!(saw_error, "request.error must be traced");
}

#[test]
fn level_gate_drops_verbose_events() {
    let (_dir, path, server) = traced_server(TraceFormat::Detail, 1);
    server.exchange(b"GET /page.txt HTTP/1.1\r\nHost: x\r\n\r\n");

    let log = std::fs::read_to_string(&path).unwrap();
    // request.start and rx.complete emit at level 2, above the gate.
    assert!(!log.contains("request.start"));
    assert!(!log.contains("rx.complete"));
}

#[test]
fn event_level_override_promotes_an_event() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.log");
    let mut trace = Trace::open(&path, 1, TraceFormat::Detail, 0, 0, None).unwrap();
    trace.set_event_level("request.start", 0);

    let docs = dir.path().join("docs");
    std::fs::create_dir(&docs).unwrap();
    std::fs::write(docs.join("a.txt"), b"x").unwrap();
    let server = TestServer::new();
    server.add_route(mazurka_http::router::default_route(&docs));
    server.http.set_trace(trace);

    server.exchange(b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    let log = std::fs::read_to_string(&path).unwrap();
    assert!(log.contains("request.start"), "promoted event must pass the gate");
    assert!(!log.contains("rx.complete"));
}

#[test]
fn header_line_written_once_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h.log");
    let trace = Trace::open(&path, 5, TraceFormat::Detail, 0, 0, Some("#Version: 1.0".into())).unwrap();
    trace.event("tick", 0, &[]);
    let log = std::fs::read_to_string(&path).unwrap();
    assert!(log.starts_with("#Version: 1.0\n"));
}
