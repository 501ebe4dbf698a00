//! Static file server with directory listings, caching headers and a
//! custom 404 page.

use std::time::Duration;

use mazurka_http::cache::CacheProfile;
use mazurka_http::router::default_route;
use mazurka_http::{Endpoint, Host, Http, Server, init_logging};

fn main() -> mazurka_http::HttpResult<()> {
    init_logging();
    let http = Http::new();

    let host = Host::new("*");
    let mut site = default_route("./documents");
    site.add_error_document(404, "/404.html");
    site.add_cache_profile(CacheProfile {
        extensions: vec!["css".into(), "js".into(), "png".into()],
        lifespan: Duration::from_secs(300),
        client_lifespan: Some(Duration::from_secs(3600)),
        ..Default::default()
    });
    host.add_route(site)?;
    http.add_host(host);

    http.add_endpoint(Endpoint::new("0.0.0.0", 8080)?);
    println!("serving ./documents on http://0.0.0.0:8080/");
    Server::new(http).serve()
}
