//! Boundary behavior for configured limits.

mod common;

use common::TestServer;
use mazurka_http::router::Route;

fn echo_server() -> TestServer {
    let server = TestServer::new();
    let mut route = Route::new("echo", "^/echo$");
    route.set_handler("action");
    server.add_route(route);
    server.http.define_action("/echo", |conn| {
        let body = conn.read_body_bytes();
        conn.tx.length = body.len() as i64;
        conn.write(body)?;
        conn.finalize_output();
        Ok(())
    });
    server
}

#[test]
fn oversize_header_block_rejected_with_413() {
    let server = echo_server();
    let mut limits = (*server.http.limits()).clone();
    limits.header_size = 256;
    server.http.set_limits(limits);

    let raw = format!(
        "GET /echo HTTP/1.1\r\nHost: x\r\nX-Pad: {}\r\n\r\n",
        "p".repeat(512)
    );
    let response = server.exchange(raw.as_bytes());
    assert_eq!(response.status, 413);
}

#[test]
fn too_many_headers_rejected_with_413() {
    let server = echo_server();
    let mut raw = String::from("GET /echo HTTP/1.1\r\nHost: x\r\n");
    for i in 0..100 {
        raw.push_str(&format!("X-H{i}: v\r\n"));
    }
    raw.push_str("\r\n");
    let response = server.exchange(raw.as_bytes());
    assert_eq!(response.status, 413);
}

#[test]
fn oversize_body_rejected_with_413() {
    let server = echo_server();
    let mut limits = (*server.http.limits()).clone();
    limits.receive_body_size = 16;
    server.http.set_limits(limits);

    let raw = format!(
        "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: 64\r\n\r\n{}",
        "b".repeat(64)
    );
    let response = server.exchange(raw.as_bytes());
    assert_eq!(response.status, 413);
}

#[test]
fn oversize_form_rejected_with_413() {
    let server = echo_server();
    let mut limits = (*server.http.limits()).clone();
    limits.receive_form_size = 16;
    server.http.set_limits(limits);

    let form = format!("field={}", "v".repeat(64));
    let raw = format!(
        "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {}\r\n\r\n{form}",
        form.len()
    );
    let response = server.exchange(raw.as_bytes());
    assert_eq!(response.status, 413);
}

#[test]
fn keep_alive_exhaustion_closes_connection() {
    let server = echo_server();
    let mut limits = (*server.http.limits()).clone();
    limits.keep_alive_max = 1;
    server.http.set_limits(limits);

    let raw = b"GET /echo HTTP/1.1\r\nHost: x\r\n\r\nGET /echo HTTP/1.1\r\nHost: x\r\n\r\n";
    let output = server.exchange_raw(raw);
    let responses = common::split_responses(&output);
    assert_eq!(responses.len(), 2, "both pipelined requests answered");
    let second = common::parse_response(&responses[1]);
    assert_eq!(second.header("connection"), Some("close"));
}

#[test]
fn error_notifier_sees_failures() {
    use std::sync::{Arc, Mutex};

    let server = echo_server();
    let seen: Arc<Mutex<Vec<(u16, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    server.http.set_error_notifier(move |status, _msg, uri| {
        sink.lock().unwrap().push((status, uri.to_string()));
    });

    server.exchange(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, 404);
    assert_eq!(events[0].1, "/missing");
}

#[test]
fn transmit_budget_caps_output() {
    let server = TestServer::new();
    let mut route = Route::new("big", "^/big$");
    route.set_handler("action");
    server.add_route(route);
    server.http.define_action("/big", |conn| {
        conn.tx.remaining_output = 10;
        conn.tx.length = 10;
        conn.write(vec![b'x'; 100])?;
        conn.finalize_output();
        Ok(())
    });

    let response = server.exchange(b"GET /big HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.body.len(), 10);
}
