//! Virtual host selection by Host header.

mod common;

use mazurka_http::conn::Conn;
use mazurka_http::router::{Route, Target};
use mazurka_http::socket::MemorySocket;
use mazurka_http::{Host, Http};

fn write_route(body: &str) -> Route {
    let mut route = Route::new(body.to_string(), "");
    route.set_target(Target::Write { status: 200, body: body.into() });
    route
}

#[test]
fn host_header_selects_virtual_host() {
    let http = Http::new();

    let main = Host::new("example.com");
    main.add_route(write_route("main")).unwrap();
    http.add_host(main);

    let api = Host::new("api.example.com");
    api.add_route(write_route("api")).unwrap();
    http.add_host(api);

    let exchange = |raw: &[u8]| {
        let socket = MemorySocket::with_input(raw.to_vec());
        let handle = socket.handle();
        handle.close_input();
        let mut conn = Conn::accept(http.clone(), Box::new(socket));
        conn.io_event(true, false);
        common::parse_response(&handle.output())
    };

    let response = exchange(b"GET / HTTP/1.1\r\nHost: api.example.com\r\n\r\n");
    assert_eq!(response.body, b"api");

    let response = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert_eq!(response.body, b"main");

    // A port suffix does not break matching; unknown hosts fall back to
    // the first configured host.
    let response = exchange(b"GET / HTTP/1.1\r\nHost: api.example.com:8080\r\n\r\n");
    assert_eq!(response.body, b"api");

    let response = exchange(b"GET / HTTP/1.1\r\nHost: unknown.example.org\r\n\r\n");
    assert_eq!(response.body, b"main");
}

#[test]
fn wildcard_suffix_host_matches_subdomains() {
    let http = Http::new();

    let wild = Host::new("*.example.com");
    wild.add_route(write_route("wild")).unwrap();
    http.add_host(wild);

    let socket = MemorySocket::with_input(
        b"GET / HTTP/1.1\r\nHost: deep.example.com\r\n\r\n".to_vec(),
    );
    let handle = socket.handle();
    handle.close_input();
    let mut conn = Conn::accept(http.clone(), Box::new(socket));
    conn.io_event(true, false);
    let response = common::parse_response(&handle.output());
    assert_eq!(response.body, b"wild");
}
