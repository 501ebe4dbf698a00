//! Minimal server: one action route answering every GET on /hello.

use mazurka_http::router::{Route, Target};
use mazurka_http::{Endpoint, Host, Http, Server, init_logging};

fn main() -> mazurka_http::HttpResult<()> {
    init_logging();
    let http = Http::new();

    let host = Host::new("*");
    let mut hello = Route::new("hello", "^/hello$");
    hello.set_target(Target::Write { status: 200, body: "Hello, World!\n".into() });
    host.add_route(hello)?;
    http.add_host(host);

    http.add_endpoint(Endpoint::new("0.0.0.0", 8080)?);
    println!("listening on http://0.0.0.0:8080/hello");
    Server::new(http).workers(2).serve()
}
