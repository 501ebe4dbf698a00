//! Sessions and CSRF tokens across requests.

mod common;

use common::TestServer;
use mazurka_http::router::Route;

fn session_server() -> TestServer {
    let server = TestServer::new();
    let mut route = Route::new("app", "^/count$");
    route.set_handler("action");
    server.add_route(route);
    server.http.define_action("/count", |conn| {
        let views: u32 = conn
            .session(true)
            .and_then(|s| s.get("views").map(|v| v.to_string()))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = views + 1;
        if let Some(session) = conn.session(true) {
            session.set("views", next.to_string());
        }
        let body = format!("views={next}");
        conn.tx.length = body.len() as i64;
        conn.write(body.into_bytes())?;
        conn.finalize_output();
        Ok(())
    });
    server
}

fn session_cookie(response: &common::Response) -> Option<String> {
    response
        .headers_named("set-cookie")
        .iter()
        .find(|c| c.starts_with("-http-session-="))
        .map(|c| c.split(';').next().unwrap().to_string())
}

#[test]
fn session_cookie_issued_with_http_only() {
    let server = session_server();
    let response = server.exchange(b"GET /count HTTP/1.1\r\nHost: x\r\n\r\n");
    let cookie = response
        .headers_named("set-cookie")
        .iter()
        .find(|c| c.starts_with("-http-session-="))
        .map(|c| c.to_string())
        .expect("session cookie missing");
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Path=/"));
    assert_eq!(response.body_text(), "views=1");
}

#[test]
fn session_state_persists_across_requests() {
    let server = session_server();
    let first = server.exchange(b"GET /count HTTP/1.1\r\nHost: x\r\n\r\n");
    let cookie = session_cookie(&first).unwrap();

    let raw = format!("GET /count HTTP/1.1\r\nHost: x\r\nCookie: {cookie}\r\n\r\n");
    let second = server.exchange(raw.as_bytes());
    assert_eq!(second.body_text(), "views=2");

    let third = server.exchange(raw.as_bytes());
    assert_eq!(third.body_text(), "views=3");
}

#[test]
fn unknown_session_id_starts_fresh() {
    let server = session_server();
    let raw = b"GET /count HTTP/1.1\r\nHost: x\r\nCookie: -http-session-=bogus\r\n\r\n";
    let response = server.exchange(raw);
    assert_eq!(response.body_text(), "views=1");
    assert!(session_cookie(&response).is_some(), "fresh id must be issued");
}

fn csrf_server() -> TestServer {
    let server = TestServer::new();
    let mut issue = Route::new("issue", "^/form$");
    issue.set_handler("action");
    server.add_route(issue);
    let mut submit = Route::new("submit", "^/submit$");
    submit.set_handler("action");
    server.add_route(submit);

    server.http.define_action("/form", |conn| {
        conn.add_security_token()?;
        conn.tx.length = 2;
        conn.write(b"ok".to_vec())?;
        conn.finalize_output();
        Ok(())
    });
    server.http.define_action("/submit", |conn| {
        let ok = conn.check_security_token()?;
        let body = if ok { "accepted" } else { "rejected" };
        conn.tx.length = body.len() as i64;
        conn.write(body.as_bytes().to_vec())?;
        conn.finalize_output();
        Ok(())
    });
    server
}

#[test]
fn csrf_token_round_trips_via_header() {
    let server = csrf_server();
    let issue = server.exchange(b"GET /form HTTP/1.1\r\nHost: x\r\n\r\n");
    let token = issue.header("x-xsrf-token").expect("token header missing").to_string();
    assert!(issue
        .headers_named("set-cookie")
        .iter()
        .any(|c| c.starts_with("XSRF-TOKEN=")));
    let session = session_cookie(&issue).unwrap();

    let raw = format!(
        "POST /submit HTTP/1.1\r\nHost: x\r\nCookie: {session}\r\nX-XSRF-TOKEN: {token}\r\nContent-Length: 0\r\n\r\n"
    );
    let response = server.exchange(raw.as_bytes());
    assert_eq!(response.body_text(), "accepted");
}

#[test]
fn csrf_mismatch_rejected_and_reissued() {
    let server = csrf_server();
    let issue = server.exchange(b"GET /form HTTP/1.1\r\nHost: x\r\n\r\n");
    let session = session_cookie(&issue).unwrap();

    let raw = format!(
        "POST /submit HTTP/1.1\r\nHost: x\r\nCookie: {session}\r\nX-XSRF-TOKEN: forged\r\nContent-Length: 0\r\n\r\n"
    );
    let response = server.exchange(raw.as_bytes());
    assert_eq!(response.body_text(), "rejected");
    // Mismatch forces a fresh token.
    assert!(response.header("x-xsrf-token").is_some());
}

#[test]
fn session_survives_in_cache_between_conns() {
    let server = session_server();
    let first = server.exchange(b"GET /count HTTP/1.1\r\nHost: x\r\n\r\n");
    let cookie = session_cookie(&first).unwrap();
    let id = cookie.split('=').nth(1).unwrap();
    assert!(server.http.sessions.load(id).is_some());
}
