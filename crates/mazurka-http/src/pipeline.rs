//! Pipeline assembly: turn a matched route into the per-request TX and
//! RX queue chains.

use std::sync::Arc;

use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::packet::Packet;
use crate::queue::Queue;
use crate::stage::{Dir, Stage, StageKind};

impl Conn {
    /// Build the TX and RX chains for the routed request, open every
    /// queue and inject the header packet.
    pub fn create_pipeline(&mut self) -> HttpResult<()> {
        let route = self
            .rx
            .route
            .clone()
            .ok_or_else(|| HttpError::Internal("pipeline without a route".into()))?;

        let handler = self.select_handler()?;
        self.tx.remaining_output = self.limits.transmit_body_size;

        // TX chain: handler, cache capture, route filters, range, chunk,
        // connector. Each candidate joins only if it matches. Filters
        // that need buffered bytes (anything route-configured, plus the
        // cache capture) disqualify the sendfile fast path.
        let mut tx_stages: Vec<Arc<dyn Stage>> = vec![handler.clone()];
        let mut transforming = 0usize;
        for name in ["cache-filter"] {
            if let Some(stage) = self.http.stage(name)
                && stage.matches(self, Dir::Tx)
            {
                tx_stages.push(stage);
                transforming += 1;
            }
        }
        for name in &route.filters {
            let stage = self
                .http
                .stage(name)
                .ok_or_else(|| HttpError::Internal(format!("unknown filter {name}")))?;
            if stage.kind() == StageKind::Filter && stage.matches(self, Dir::Tx) {
                tx_stages.push(stage);
                transforming += 1;
            }
        }
        for name in ["websocket", "range", "chunk"] {
            if let Some(stage) = self.http.stage(name)
                && stage.matches(self, Dir::Tx)
            {
                tx_stages.push(stage);
            }
        }
        let connector = self.select_connector(transforming, &handler)?;
        self.tx.handler_name = Some(handler.name());
        self.tx.connector_name = Some(connector.name());
        self.tx.sendfile = connector.name() == "send";
        tx_stages.push(connector);

        // RX chain: upload and websocket decoding plus any route filter
        // that wants the incoming direction, ending at the handler.
        let mut rx_stages: Vec<Arc<dyn Stage>> = Vec::new();
        for name in ["upload", "websocket"] {
            if let Some(stage) = self.http.stage(name)
                && stage.matches(self, Dir::Rx)
            {
                rx_stages.push(stage);
            }
        }
        for name in &route.filters {
            if let Some(stage) = self.http.stage(name)
                && stage.kind() == StageKind::Filter
                && stage.matches(self, Dir::Rx)
                && !rx_stages.iter().any(|s| s.name() == stage.name())
            {
                rx_stages.push(stage);
            }
        }
        rx_stages.push(handler);

        self.link_stages(tx_stages, rx_stages)?;
        Ok(())
    }

    /// Minimal pipeline used when a request fails before routing: a
    /// pass handler straight into the net connector.
    pub fn create_error_pipeline(&mut self) -> HttpResult<()> {
        let pass = self
            .http
            .stage("pass")
            .ok_or_else(|| HttpError::Internal("pass handler unregistered".into()))?;
        let net = self
            .http
            .stage("net")
            .ok_or_else(|| HttpError::Internal("net connector unregistered".into()))?;
        self.tx.handler_name = Some(pass.name());
        self.tx.connector_name = Some(net.name());
        self.link_stages(vec![pass.clone(), net], vec![pass])
    }

    /// Client-side pipeline: the composed request goes straight out
    /// through the net connector; the parsed response body lands on the
    /// pass handler's queue for the caller to read.
    pub fn create_client_pipeline(&mut self) -> HttpResult<()> {
        let pass = self
            .http
            .stage("pass")
            .ok_or_else(|| HttpError::Internal("pass handler unregistered".into()))?;
        let net = self
            .http
            .stage("net")
            .ok_or_else(|| HttpError::Internal("net connector unregistered".into()))?;
        self.link_stages(vec![pass.clone(), net], vec![pass])
    }

    fn select_handler(&mut self) -> HttpResult<Arc<dyn Stage>> {
        let route = self
            .rx
            .route
            .clone()
            .ok_or_else(|| HttpError::Internal("handler selection without a route".into()))?;

        // CORS preflight short-circuits into the pass handler; the
        // route's response headers carry the Access-Control grants.
        if route.cors.is_some()
            && self.rx.method == crate::http::Method::Options
            && self.rx.header("access-control-request-method").is_some()
        {
            return self
                .http
                .stage("pass")
                .ok_or_else(|| HttpError::Internal("pass handler unregistered".into()));
        }

        // A fresh cached entry short-circuits into the replay handler.
        if let Some(profile) = crate::cache::server_profile(self) {
            let key = crate::cache::cache_key(self, profile.unique);
            let fresh = self
                .host
                .as_ref()
                .map(|h| h.cache.lookup(&key).is_some())
                .unwrap_or(false);
            if fresh
                && let Some(stage) = self.http.stage("cache")
            {
                return Ok(stage);
            }
        }

        for name in &route.handlers {
            if let Some(stage) = self.http.stage(name)
                && stage.kind() == StageKind::Handler
                && stage.matches(self, Dir::Tx)
            {
                return Ok(stage);
            }
        }
        if let Some(ref ext) = self.rx.uri.ext
            && let Some(name) = route.extension_handlers.get(ext)
        {
            if let Some(stage) = self.http.stage(name) {
                return Ok(stage);
            }
        }
        if let Some(ref name) = route.handler {
            return self
                .http
                .stage(name)
                .ok_or_else(|| HttpError::Internal(format!("unknown handler {name}")));
        }
        self.http
            .stage("file")
            .ok_or_else(|| HttpError::Internal("file handler unregistered".into()))
    }

    fn select_connector(
        &mut self,
        transforming: usize,
        handler: &Arc<dyn Stage>,
    ) -> HttpResult<Arc<dyn Stage>> {
        // The sendfile fast path applies only when no filter between the
        // file handler and the socket needs the body bytes in memory.
        if handler.name() == "file"
            && transforming == 0
            && !self.secure
            && self.rx.ranges.is_empty()
            && self.rx.method == crate::http::Method::Get
            && let Some(send) = self.http.stage("send")
            && send.matches(self, Dir::Tx)
        {
            return Ok(send);
        }
        self.http
            .stage("net")
            .ok_or_else(|| HttpError::Internal("net connector unregistered".into()))
    }

    fn link_stages(
        &mut self,
        tx_stages: Vec<Arc<dyn Stage>>,
        rx_stages: Vec<Arc<dyn Stage>>,
    ) -> HttpResult<()> {
        let limits = self.limits.clone();
        self.pipeline.clear();

        let mut tx_ids = Vec::with_capacity(tx_stages.len());
        for stage in &tx_stages {
            let mut queue = Queue::new(stage.clone(), Dir::Tx, limits.queue_max, limits.packet_size);
            if stage.kind() == StageKind::Connector {
                // Double the connector's acceptance to smooth bursts.
                queue.max *= 2;
                queue.low = queue.max / 2;
            }
            self.pipeline.queues.push(queue);
            tx_ids.push(self.pipeline.queues.len() - 1);
        }
        for window in tx_ids.windows(2) {
            self.pipeline.queues[window[0]].next = Some(window[1]);
            self.pipeline.queues[window[1]].prev = Some(window[0]);
        }

        let mut rx_ids = Vec::with_capacity(rx_stages.len());
        for stage in &rx_stages {
            let queue = Queue::new(stage.clone(), Dir::Rx, limits.queue_max, limits.packet_size);
            self.pipeline.queues.push(queue);
            rx_ids.push(self.pipeline.queues.len() - 1);
        }
        for window in rx_ids.windows(2) {
            self.pipeline.queues[window[0]].next = Some(window[1]);
            self.pipeline.queues[window[1]].prev = Some(window[0]);
        }

        // Pair queues when the same stage sits on both sides.
        for &tx_id in &tx_ids {
            let name = self.pipeline.queues[tx_id].stage.name();
            if let Some(&rx_id) = rx_ids
                .iter()
                .find(|&&rx_id| self.pipeline.queues[rx_id].stage.name() == name)
            {
                self.pipeline.queues[tx_id].pair = Some(rx_id);
                self.pipeline.queues[rx_id].pair = Some(tx_id);
            }
        }

        self.pipeline.tx_head = tx_ids.first().copied();
        self.pipeline.tx_tail = tx_ids.last().copied();
        self.pipeline.rx_head = rx_ids.first().copied();
        self.pipeline.rx_tail = rx_ids.last().copied();
        self.pipeline.created = true;

        for q in 0..self.pipeline.queues.len() {
            let stage = self.pipeline.queues[q].stage.clone();
            stage.open(self, q)?;
        }

        // The header packet rides ahead of all entity data and is
        // rendered by the connector once it arrives there. The queue is
        // deliberately not scheduled yet: the first handler write (or
        // finalize) schedules it, after status and length are known.
        if let Some(head) = self.pipeline.tx_head {
            self.pipeline.queues[head].enqueue_front(Packet::header());
        }
        Ok(())
    }
}
