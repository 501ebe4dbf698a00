//! Listener endpoints: an address binding plus the virtual hosts it
//! serves. TLS endpoints are marked secure; the TLS session itself is
//! the socket layer's business.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use crate::error::{HttpError, HttpResult};
use crate::host::Host;

pub struct Endpoint {
    addr: SocketAddr,
    secure: bool,
    hosts: RwLock<Vec<Arc<Host>>>,
}

impl Endpoint {
    pub fn new(ip: &str, port: u16) -> HttpResult<Arc<Endpoint>> {
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|_| HttpError::Internal(format!("bad endpoint address {ip}:{port}")))?;
        Ok(Arc::new(Endpoint {
            addr,
            secure: false,
            hosts: RwLock::new(Vec::new()),
        }))
    }

    pub fn new_secure(ip: &str, port: u16) -> HttpResult<Arc<Endpoint>> {
        let endpoint = Endpoint::new(ip, port)?;
        // Arc::new above has no other owners yet.
        let mut inner = Arc::try_unwrap(endpoint)
            .map_err(|_| HttpError::Internal("endpoint unexpectedly shared".into()))?;
        inner.secure = true;
        Ok(Arc::new(inner))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn add_host(&self, host: Arc<Host>) {
        self.hosts.write().expect("endpoint hosts poisoned").push(host);
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().expect("endpoint hosts poisoned").clone()
    }

    /// The host serving `name` on this endpoint, falling back to the
    /// endpoint's first host.
    pub fn host_for(&self, name: Option<&str>) -> Option<Arc<Host>> {
        let hosts = self.hosts.read().expect("endpoint hosts poisoned");
        if let Some(name) = name {
            let bare = name.rsplit_once(':').map(|(h, _)| h).unwrap_or(name);
            if let Some(host) = hosts.iter().find(|h| h.matches(bare)) {
                return Some(host.clone());
            }
        }
        hosts.first().cloned()
    }
}
