//! The server front end: per-endpoint worker threads with their own
//! SO_REUSEPORT listeners, signal-driven graceful shutdown, and the
//! monitor timer.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use crate::context::Http;
use crate::dispatch::Worker;
use crate::error::{HttpError, HttpResult};
use crate::monitor::MonitorSystem;
use crate::syscalls;

pub struct Server {
    http: Arc<Http>,
    workers: usize,
}

impl Server {
    pub fn new(http: Arc<Http>) -> Server {
        Server {
            http,
            workers: num_cpus::get(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Server {
        self.workers = workers.max(1);
        self
    }

    /// Serve every configured endpoint until shutdown. Blocks the
    /// calling thread.
    pub fn serve(self) -> HttpResult<()> {
        let endpoints = self.http.endpoints();
        if endpoints.is_empty() {
            return Err(HttpError::Internal("no endpoints configured".into()));
        }

        let shutdown = self.http.shutdown_flag();
        let signal_flag = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received; draining");
            signal_flag.store(true, Ordering::Release);
        })
        .map_err(|e| HttpError::Internal(format!("cannot install signal handler: {e}")))?;

        MonitorSystem::start(self.http.clone());

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles: Vec<thread::JoinHandle<()>> = Vec::new();

        for endpoint in &endpoints {
            tracing::info!(addr = %endpoint.addr(), workers = self.workers, "listening");
            for worker_id in 0..self.workers {
                let listen_fd = syscalls::listen_socket(&endpoint.addr(), 4096)?;
                let core_id = core_ids.get(worker_id % core_ids.len().max(1)).copied();
                let http = self.http.clone();
                let endpoint = endpoint.clone();
                let shutdown = shutdown.clone();
                let handle = thread::Builder::new()
                    .name(format!("mazurka-worker-{worker_id}"))
                    .spawn(move || {
                        if let Some(id) = core_id {
                            core_affinity::set_for_current(id);
                        }
                        let mut worker = Worker::new(worker_id, http, endpoint, listen_fd);
                        if let Err(err) = worker.run(shutdown) {
                            tracing::error!(worker = worker_id, error = %err, "worker exited");
                        }
                        syscalls::close(listen_fd);
                    })
                    .map_err(|e| HttpError::Internal(format!("cannot spawn worker: {e}")))?;
                handles.push(handle);
            }
        }

        for handle in handles {
            let _ = handle.join();
        }

        // Workers only exit once drained, so this completes promptly.
        while !self.http.is_idle() {
            thread::sleep(std::time::Duration::from_millis(50));
        }
        self.http.destroy()
    }
}
