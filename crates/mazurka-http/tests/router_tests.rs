//! Route matching: conditions, updates, targets, rewrites, CORS.

mod common;

use common::TestServer;
use mazurka_http::router::{Condition, CorsConfig, HeaderOp, Route, Target, Update};

#[test]
fn write_target_emits_literal_body() {
    let server = TestServer::new();
    let mut route = Route::new("w", "^/hello$");
    route.set_target(Target::Write { status: 201, body: "made".into() });
    server.add_route(route);

    let response = server.exchange(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 201);
    assert_eq!(response.body, b"made");
}

#[test]
fn redirect_target_sets_location() {
    let server = TestServer::new();
    let mut route = Route::new("r", "^/old$");
    route.set_target(Target::Redirect { status: 0, target: "/new".into() });
    server.add_route(route);

    let response = server.exchange(b"GET /old HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 302, "default redirect status applies");
    assert_eq!(response.header("location"), Some("/new"));
}

#[test]
fn close_target_drops_connection_without_response() {
    let server = TestServer::new();
    let mut route = Route::new("c", "^/die$");
    route.set_target(Target::Close);
    server.add_route(route);

    let (mut conn, handle) = server.open(b"GET /die HTTP/1.1\r\nHost: x\r\n\r\n");
    conn.io_event(true, false);
    assert!(handle.output().is_empty());
    assert!(handle.is_closed());
}

#[test]
fn tokens_bind_to_params_in_declared_order() {
    let server = TestServer::new();
    let mut route = Route::new("t", "^/user/{id}/file/{name}$");
    route.set_target(Target::Write { status: 200, body: "id=${id} name=${name} one=$1".into() });
    server.add_route(route);

    let response = server.exchange(b"GET /user/42/file/report HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.body_text(), "id=42 name=report one=42");
}

#[test]
fn methods_filter_routes() {
    let server = TestServer::new();
    let mut post_only = Route::new("p", "^/thing$");
    post_only.set_methods(&["POST"]);
    post_only.set_target(Target::Write { status: 200, body: "posted".into() });
    server.add_route(post_only);

    let ok = server.exchange(b"POST /thing HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(ok.status, 200);

    let miss = server.exchange(b"GET /thing HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(miss.status, 404);
}

#[test]
fn head_matches_get_only_routes() {
    let server = TestServer::new();
    let mut route = Route::new("g", "^/page$");
    route.set_methods(&["GET"]);
    route.set_target(Target::Write { status: 200, body: "page".into() });
    server.add_route(route);

    let response = server.exchange(b"HEAD /page HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 200);
    assert!(response.body.is_empty(), "HEAD suppresses the body");
}

#[test]
fn header_check_gates_route() {
    let server = TestServer::new();
    let mut route = Route::new("api", "^/api$");
    route.add_header_check("X-Api-Version", "^2\\.", false).unwrap();
    route.set_target(Target::Write { status: 200, body: "v2".into() });
    server.add_route(route);

    let hit = server.exchange(b"GET /api HTTP/1.1\r\nHost: x\r\nX-Api-Version: 2.1\r\n\r\n");
    assert_eq!(hit.status, 200);

    let miss = server.exchange(b"GET /api HTTP/1.1\r\nHost: x\r\nX-Api-Version: 1.0\r\n\r\n");
    assert_eq!(miss.status, 404);
}

#[test]
fn param_check_gates_route() {
    let server = TestServer::new();
    let mut route = Route::new("q", "^/search$");
    route.add_param_check("q", ".+", false).unwrap();
    route.set_target(Target::Write { status: 200, body: "found".into() });
    server.add_route(route);

    assert_eq!(server.exchange(b"GET /search?q=x HTTP/1.1\r\nHost: x\r\n\r\n").status, 200);
    assert_eq!(server.exchange(b"GET /search HTTP/1.1\r\nHost: x\r\n\r\n").status, 404);
}

#[test]
fn match_condition_rewrites_and_rescans() {
    let server = TestServer::new();
    let mut rewriter = Route::new("legacy", "^/legacy/.*$");
    rewriter.add_condition(Condition::Match {
        pattern: regex::Regex::new("^/legacy/(.*)$").unwrap(),
        value: "$&".into(),
        negate: false,
        rewrite: Some("/modern/$1".into()),
    });
    server.add_route(rewriter);

    let mut modern = Route::new("modern", "^/modern/{page}$");
    modern.set_target(Target::Write { status: 200, body: "page=${page}".into() });
    server.add_route(modern);

    let response = server.exchange(b"GET /legacy/about HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 200);
    assert_eq!(response.body_text(), "page=about");
}

#[test]
fn too_many_rewrites_is_an_internal_error() {
    let server = TestServer::new();
    let mut looper = Route::new("loop", "^/loop$");
    looper.add_condition(Condition::Match {
        pattern: regex::Regex::new("^/loop$").unwrap(),
        value: "$&".into(),
        negate: false,
        rewrite: Some("/loop".into()),
    });
    server.add_route(looper);

    let response = server.exchange(b"GET /loop HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 500);
}

#[test]
fn allow_deny_condition_rejects_denied_peers() {
    let server = TestServer::new();
    let mut route = Route::new("internal", "^/internal$");
    route.add_condition(Condition::AllowDeny {
        allow: vec!["10.".into()],
        deny: vec![],
    });
    route.set_target(Target::Write { status: 200, body: "internal".into() });
    server.add_route(route);

    // The memory socket peer is 127.0.0.1, which the allow list excludes.
    let response = server.exchange(b"GET /internal HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 403);
}

#[test]
fn secure_condition_redirects_to_https() {
    let server = TestServer::new();
    let mut route = Route::new("s", "^/account$");
    route.add_condition(Condition::Secure { redirect: Some(String::new()) });
    route.set_target(Target::Write { status: 200, body: "account".into() });
    server.add_route(route);

    let response = server.exchange(b"GET /account HTTP/1.1\r\nHost: shop.example\r\n\r\n");
    assert_eq!(response.status, 301);
    assert_eq!(response.header("location"), Some("https://shop.example/account"));
}

#[test]
fn param_update_sets_value() {
    let server = TestServer::new();
    let mut route = Route::new("u", "^/tagged$");
    route.add_update(Update::Param { name: "tag".into(), template: "fixed-${missing}x".into() });
    route.set_target(Target::Write { status: 200, body: "tag=${tag}".into() });
    server.add_route(route);

    let response = server.exchange(b"GET /tagged HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.body_text(), "tag=fixed-x");
}

#[test]
fn response_header_ops_apply() {
    let server = TestServer::new();
    let mut route = Route::new("h", "^/headered$");
    route.add_header_op(HeaderOp::Set("X-Custom".into(), "one".into()));
    route.add_header_op(HeaderOp::Append("Vary".into(), "Origin".into()));
    route.add_header_op(HeaderOp::Remove("X-XSS-Protection".into()));
    route.set_target(Target::Write { status: 200, body: "h".into() });
    server.add_route(route);

    let response = server.exchange(b"GET /headered HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.header("x-custom"), Some("one"));
    assert_eq!(response.header("vary"), Some("Origin"));
}

#[test]
fn cors_headers_emitted_for_allowed_origin() {
    let server = TestServer::new();
    let mut route = Route::new("api", "^/api$");
    route.cors = Some(CorsConfig {
        origins: vec!["https://app.example".into()],
        credentials: true,
        headers: vec!["Content-Type".into()],
        methods: vec!["GET".into(), "POST".into()],
        max_age: 600,
    });
    route.set_target(Target::Write { status: 200, body: "api".into() });
    server.add_route(route);

    let response = server.exchange(
        b"GET /api HTTP/1.1\r\nHost: x\r\nOrigin: https://app.example\r\n\r\n",
    );
    assert_eq!(
        response.header("access-control-allow-origin"),
        Some("https://app.example")
    );
    assert_eq!(response.header("access-control-allow-credentials"), Some("true"));

    let other = server.exchange(b"GET /api HTTP/1.1\r\nHost: x\r\nOrigin: https://evil.example\r\n\r\n");
    assert!(other.header("access-control-allow-origin").is_none());
}

#[test]
fn cors_preflight_short_circuits() {
    let server = TestServer::new();
    let mut route = Route::new("api", "^/api$");
    route.cors = Some(CorsConfig {
        origins: vec!["*".into()],
        credentials: false,
        headers: vec![],
        methods: vec!["GET".into()],
        max_age: 0,
    });
    route.set_handler("action");
    server.add_route(route);
    server.http.define_action("/api", |_conn| panic!("preflight must not reach the handler"));

    let response = server.exchange(
        b"OPTIONS /api HTTP/1.1\r\nHost: x\r\nOrigin: https://a.example\r\n\
          Access-Control-Request-Method: GET\r\n\r\n",
    );
    assert_eq!(response.status, 200);
    assert_eq!(response.header("access-control-allow-origin"), Some("*"));
    assert_eq!(response.header("access-control-allow-methods"), Some("GET"));
}

#[test]
fn route_inheritance_copies_configuration() {
    let mut parent = Route::new("parent", "");
    parent.set_documents("/srv/docs");
    parent.add_header_op(HeaderOp::Set("X-App".into(), "m".into()));
    parent.session_cookie = "-app-session-".into();

    let child = Route::inherit("child", "^/sub$", &parent);
    assert_eq!(child.documents, std::path::PathBuf::from("/srv/docs"));
    assert_eq!(child.session_cookie, "-app-session-");
    assert_eq!(child.header_ops.len(), 1);
}

#[test]
fn unauthorized_condition_blocks_logged_in_users() {
    let server = TestServer::new();
    let mut route = Route::new("anon", "^/welcome$");
    route.add_condition(Condition::Unauthorized);
    route.set_target(Target::Write { status: 200, body: "welcome".into() });
    server.add_route(route);

    // Anonymous request passes.
    let response = server.exchange(b"GET /welcome HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(response.status, 200);
}
