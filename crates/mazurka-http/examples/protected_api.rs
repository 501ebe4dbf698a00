//! Digest-protected JSON endpoint with per-address abuse defense.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mazurka_http::auth::{Auth, AuthType};
use mazurka_http::monitor::{Counter, Relation};
use mazurka_http::router::Route;
use mazurka_http::{Endpoint, Host, Http, Server, init_logging};

fn main() -> mazurka_http::HttpResult<()> {
    init_logging();
    let http = Http::new();

    let mut auth = Auth::new("api");
    auth.set_type(AuthType::Digest);
    auth.add_role("reader", &["read"]);
    auth.add_user("ada", "s3cret", &["reader"]);
    let auth = Arc::new(auth);

    let host = Host::new("*");
    let mut api = Route::new("status", "^/api/status$");
    api.set_handler("action");
    api.set_auth(auth);
    api.require_abilities(&["read"]);
    host.add_route(api)?;
    http.add_host(host);

    http.define_action("/api/status", |conn| {
        let user = conn.username.clone().unwrap_or_default();
        let body = format!("{{\"status\":\"ok\",\"user\":\"{user}\"}}");
        conn.tx.mime_type = Some("application/json".into());
        conn.tx.length = body.len() as i64;
        conn.write(body.into_bytes())?;
        conn.finalize_output();
        Ok(())
    });

    // Ten bad requests a minute from one address earns a five-minute ban.
    http.monitor.add_defense(
        "ban-abuser",
        "ban",
        HashMap::from([
            ("PERIOD".to_string(), "300".to_string()),
            ("STATUS".to_string(), "406".to_string()),
        ]),
    );
    http.monitor.add_monitor(
        Counter::BadRequestErrors,
        Relation::Above,
        10,
        Duration::from_secs(60),
        &["ban-abuser"],
    );

    http.add_endpoint(Endpoint::new("0.0.0.0", 8443)?);
    println!("digest-protected api on http://0.0.0.0:8443/api/status (ada / s3cret)");
    Server::new(http).serve()
}
