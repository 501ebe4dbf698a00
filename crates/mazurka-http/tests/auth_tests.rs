//! Authentication flows: basic and digest challenges, ability checks,
//! session-cached identity.

mod common;

use std::sync::Arc;

use common::TestServer;
use mazurka_http::auth::{Auth, AuthType, digest};
use mazurka_http::router::{Route, Target};

fn protected_server(auth_type: AuthType) -> TestServer {
    let server = TestServer::new();
    let mut auth = Auth::new("R");
    auth.set_type(auth_type);
    auth.add_role("staff", &["view"]);
    auth.add_user("ada", "s3cret", &["staff"]);
    let auth = Arc::new(auth);

    let mut route = Route::new("secret", "^/secret$");
    route.set_auth(auth);
    route.set_target(Target::Write { status: 200, body: "granted".into() });
    server.add_route(route);
    server
}

#[test]
fn basic_auth_challenge_then_accept() {
    let server = protected_server(AuthType::Basic);

    let response = server.exchange(b"GET /secret HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 401);
    assert_eq!(response.header("www-authenticate"), Some("Basic realm=\"R\""));

    // ada:s3cret
    let response = server.exchange(
        b"GET /secret HTTP/1.1\r\nHost: x\r\nAuthorization: Basic YWRhOnMzY3JldA==\r\n\r\n",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"granted");
    // A login creates the session cookie.
    assert!(response
        .headers_named("set-cookie")
        .iter()
        .any(|c| c.starts_with("-http-session-=")));
}

#[test]
fn basic_auth_wrong_password_rechallenges() {
    let server = protected_server(AuthType::Basic);
    // ada:wrong
    let response = server.exchange(
        b"GET /secret HTTP/1.1\r\nHost: x\r\nAuthorization: Basic YWRhOndyb25n\r\n\r\n",
    );
    assert_eq!(response.status, 401);
    assert!(response.header("www-authenticate").is_some());
}

#[test]
fn digest_challenge_then_accept() {
    let server = protected_server(AuthType::Digest);

    let challenge = server.exchange(b"GET /secret HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(challenge.status, 401);
    let www = challenge
        .header("www-authenticate")
        .expect("missing digest challenge")
        .to_string();
    assert!(www.starts_with("Digest realm=\"R\""));
    assert!(www.contains("qop=\"auth\""));
    assert!(www.contains("nonce=\""));

    let authorization = digest::client_authorization(&www, "GET", "/secret", "ada", "s3cret");
    let raw = format!("GET /secret HTTP/1.1\r\nHost: x\r\nAuthorization: {authorization}\r\n\r\n");
    let response = server.exchange(raw.as_bytes());
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"granted");
}

#[test]
fn digest_wrong_password_rejected() {
    let server = protected_server(AuthType::Digest);
    let challenge = server.exchange(b"GET /secret HTTP/1.1\r\nHost: x\r\n\r\n");
    let www = challenge.header("www-authenticate").unwrap().to_string();
    let authorization = digest::client_authorization(&www, "GET", "/secret", "ada", "nope");
    let raw = format!("GET /secret HTTP/1.1\r\nHost: x\r\nAuthorization: {authorization}\r\n\r\n");
    let response = server.exchange(raw.as_bytes());
    assert_eq!(response.status, 401);
}

#[test]
fn session_cached_identity_skips_credentials() {
    let server = protected_server(AuthType::Basic);
    let first = server.exchange(
        b"GET /secret HTTP/1.1\r\nHost: x\r\nAuthorization: Basic YWRhOnMzY3JldA==\r\n\r\n",
    );
    let cookie = first
        .headers_named("set-cookie")
        .iter()
        .find(|c| c.starts_with("-http-session-="))
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let raw = format!("GET /secret HTTP/1.1\r\nHost: x\r\nCookie: {cookie}\r\n\r\n");
    let response = server.exchange(raw.as_bytes());
    assert_eq!(response.status, 200, "session identity should be accepted");
}

#[test]
fn missing_ability_yields_403() {
    let server = TestServer::new();
    let mut auth = Auth::new("R");
    auth.set_type(AuthType::Basic);
    auth.add_user("bob", "pw", &[]);
    let auth = Arc::new(auth);

    let mut route = Route::new("admin", "^/admin$");
    route.set_auth(auth);
    route.require_abilities(&["admin"]);
    route.set_target(Target::Write { status: 200, body: "top".into() });
    server.add_route(route);

    // bob:pw
    let response = server.exchange(
        b"GET /admin HTTP/1.1\r\nHost: x\r\nAuthorization: Basic Ym9iOnB3\r\n\r\n",
    );
    assert_eq!(response.status, 403);
}

#[test]
fn form_auth_redirects_to_login_page() {
    let server = TestServer::new();
    let mut auth = Auth::new("R");
    auth.set_type(AuthType::Form);
    auth.set_login_pages("/login.html", "/home.html");
    auth.add_user("ada", "s3cret", &[]);
    let auth = Arc::new(auth);

    let mut route = Route::new("app", "^/app$");
    route.set_auth(auth);
    route.set_target(Target::Write { status: 200, body: "app".into() });
    server.add_route(route);

    let response = server.exchange(b"GET /app HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 302);
    assert!(response.header("location").unwrap().ends_with("/login.html"));
}
