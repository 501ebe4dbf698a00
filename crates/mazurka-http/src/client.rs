//! The outbound HTTP client.
//!
//! Requests drive the same connection machinery as the server side: a
//! `Conn` with a pass-handler pipeline sends the composed request and
//! parses the response through the shared Rx parser. Redirects are
//! followed up to a hop limit; `Keep-Alive: max` from the server is
//! honored minus one so the client closes first.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use std::sync::Arc;

use crate::conn::{Conn, ConnState};
use crate::context::Http;
use crate::error::{HttpError, HttpResult};
use crate::headers::HeaderMap;
use crate::http::Method;
use crate::socket::{IoOutcome, Socket};
use crate::uri::Uri;

const MAX_REDIRECTS: usize = 10;

pub struct ClientResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Cookies the server set, as (name, value) pairs with attributes
    /// stripped.
    pub fn set_cookies(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
            .filter_map(|(_, v)| {
                let pair = v.split(';').next()?;
                let (name, value) = pair.split_once('=')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

pub struct Client {
    http: Arc<Http>,
    timeout: Duration,
    credentials: Option<(String, String)>,
}

impl Client {
    pub fn new(http: Arc<Http>) -> Client {
        Client {
            http,
            timeout: Duration::from_secs(30),
            credentials: None,
        }
    }

    /// A client with its own private context, for callers that are not
    /// embedded in a server (remedies, tools).
    pub fn detached() -> Client {
        Client::new(Http::new())
    }

    pub fn timeout(mut self, timeout: Duration) -> Client {
        self.timeout = timeout;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Client {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn get(&self, uri: &str) -> HttpResult<ClientResponse> {
        self.fetch(Method::Get, uri, &[], None)
    }

    pub fn post(&self, uri: &str, body: Vec<u8>) -> HttpResult<ClientResponse> {
        self.fetch(Method::Post, uri, &[], Some(body))
    }

    /// Issue a request, following redirects.
    pub fn fetch(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> HttpResult<ClientResponse> {
        let mut target = uri.to_string();
        for _hop in 0..=MAX_REDIRECTS {
            let uri = Uri::parse(&target)?;
            let response = self.request_once(method, &uri, headers, body.clone())?;
            if matches!(response.status, 301 | 302 | 307 | 308)
                && let Some(location) = response.header("location")
            {
                let next = Uri::parse(location)?;
                target = uri.resolve(&next).format();
                continue;
            }
            return Ok(response);
        }
        Err(HttpError::Comms(format!("too many redirects fetching {uri}")))
    }

    fn request_once(
        &self,
        method: Method,
        uri: &Uri,
        headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> HttpResult<ClientResponse> {
        let host = uri
            .host
            .clone()
            .ok_or_else(|| HttpError::Parse("request uri without a host".into()))?;
        let port = uri.effective_port();
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| HttpError::Comms(format!("cannot resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| HttpError::Comms(format!("no address for {host}")))?;

        let socket = BlockingSocket::connect(addr, self.timeout)?;
        let mut conn = Conn::connect(self.http.clone(), Box::new(socket));
        conn.rx.method = method;
        conn.rx.uri = uri.clone();
        conn.rx.uri_text = {
            let mut text = uri.path.clone();
            if let Some(ref query) = uri.query {
                text.push('?');
                text.push_str(query);
            }
            text
        };
        conn.create_client_pipeline()?;

        let host_header = if port == 80 || port == 443 {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        conn.tx.headers.set("Host", host_header);
        conn.tx.headers.set_default("User-Agent", self.http.server_name());
        if let Some((ref username, ref password)) = self.credentials {
            crate::auth::basic::set_auth(&mut conn.tx.headers, username, password);
        }
        for (key, value) in headers {
            conn.tx.headers.set(key.to_string(), value.to_string());
        }

        match body {
            Some(body) => {
                conn.tx.length = body.len() as i64;
                conn.write(body)?;
            }
            None => conn.tx.length = 0,
        }
        conn.finalize_output();
        conn.protocol();
        if conn.conn_error {
            return Err(HttpError::Comms("request transmission failed".into()));
        }

        let deadline = Instant::now() + self.timeout;
        while !conn.rx.eof && !conn.closed && conn.state < ConnState::Complete {
            if Instant::now() > deadline {
                return Err(HttpError::Timeout(format!("no response from {host}")));
            }
            conn.io_event(true, false);
            if conn.conn_error && !conn.rx.eof {
                return Err(HttpError::Comms("connection failed mid-response".into()));
            }
        }

        let response = ClientResponse {
            status: conn.rx.status,
            headers: conn.rx.headers.clone(),
            body: conn.read_body_bytes(),
        };
        Ok(response)
    }
}

/// A blocking TCP stream behind the non-blocking `Socket` surface: a
/// short read timeout stands in for would-block so the connection
/// driver keeps its non-blocking shape.
struct BlockingSocket {
    stream: TcpStream,
    peer: SocketAddr,
    closed: bool,
}

impl BlockingSocket {
    fn connect(addr: SocketAddr, timeout: Duration) -> HttpResult<BlockingSocket> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| HttpError::Comms(format!("connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true).ok();
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .map_err(HttpError::Io)?;
        stream.set_write_timeout(Some(timeout)).map_err(HttpError::Io)?;
        Ok(BlockingSocket {
            stream,
            peer: addr,
            closed: false,
        })
    }
}

impl Socket for BlockingSocket {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        match self.stream.read(buf) {
            Ok(n) => Ok(Some(n)),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn write(&mut self, buf: &[u8]) -> IoOutcome {
        match self.stream.write(buf) {
            Ok(n) => Ok(Some(n)),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn close(&mut self) {
        if !self.closed {
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
            self.closed = true;
        }
    }
}
