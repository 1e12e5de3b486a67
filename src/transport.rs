//! The boundary between the protocol engine and whatever carries its
//! payloads: one opaque text body out, one opaque text body back, plus a
//! few named headers.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, error};

use crate::protocol::Headers;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    pub request_index: u64,
    pub headers: Headers,
    pub body: String,
    pub is_async: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    /// Index of the request this answers, as known to the transport
    pub request_index: u64,
    pub status_code: u16,
    pub headers: Headers,
    pub content: String,
    /// Set when the transport itself failed (connection refused, timeout)
    pub error: Option<String>,
}

impl TransportResponse {
    pub fn ok(request_index: u64, content: impl Into<String>) -> Self {
        TransportResponse {
            request_index,
            status_code: 200,
            headers: Headers::new(),
            content: content.into(),
            error: None,
        }
    }

    pub fn failed(request_index: u64, status_code: u16, message: impl Into<String>) -> Self {
        TransportResponse {
            request_index,
            status_code,
            headers: Headers::new(),
            content: String::new(),
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status_code)
    }

    pub fn to_error(&self) -> Error {
        Error::Transport {
            status: self.status_code,
            message: self
                .error
                .clone()
                .unwrap_or_else(|| format!("Unexpected status code {}", self.status_code)),
        }
    }
}

/// Carries requests to the server. `send` must not block on the response;
/// `receive` yields completed responses in whatever order they finish.
pub trait Transport {
    fn send(&mut self, request: TransportRequest) -> Result<()>;

    /// Waits up to `timeout` (forever if `None`) for the next response.
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<TransportResponse>>;
}

/// Blocking request/response function run on a worker thread, e.g. an HTTP POST.
pub type Exchange = dyn Fn(&TransportRequest) -> TransportResponse + Send + Sync;

/// Runs a blocking exchange function on a pool of worker threads so several
/// requests can be outstanding at once.
pub struct ThreadedTransport {
    jobs: Option<Sender<TransportRequest>>,
    responses: Receiver<TransportResponse>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadedTransport {
    pub fn new<F>(worker_count: usize, exchange: F) -> Result<Self>
    where
        F: Fn(&TransportRequest) -> TransportResponse + Send + Sync + 'static,
    {
        if worker_count == 0 {
            return Err(Error::Config("ThreadedTransport needs at least one worker".to_string()));
        }
        let exchange: Arc<Exchange> = Arc::new(exchange);
        let (job_tx, job_rx) = channel::unbounded::<TransportRequest>();
        let (resp_tx, resp_rx) = channel::unbounded::<TransportResponse>();

        let mut workers = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let job_rx = job_rx.clone();
            let resp_tx = resp_tx.clone();
            let exchange = exchange.clone();
            let handle = std::thread::Builder::new()
                .name(format!("qproxy-transport-{}", n))
                .spawn(move || {
                    for request in job_rx.iter() {
                        let mut response = exchange(&request);
                        response.request_index = request.request_index;
                        if resp_tx.send(response).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| Error::Config(format!("Failed to spawn transport worker: {}", e)))?;
            workers.push(handle);
        }

        Ok(ThreadedTransport {
            jobs: Some(job_tx),
            responses: resp_rx,
            workers,
        })
    }
}

impl Transport for ThreadedTransport {
    fn send(&mut self, request: TransportRequest) -> Result<()> {
        let jobs = self.jobs.as_ref().ok_or_else(|| Error::Transport {
            status: 0,
            message: "Transport is closed".to_string(),
        })?;
        debug!("Queueing request {} ({} bytes)", request.request_index, request.body.len());
        jobs.send(request).map_err(|e| Error::Transport {
            status: 0,
            message: format!("Failed to queue request {}: worker pool is gone", e.0.request_index),
        })
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Option<TransportResponse>> {
        let disconnected = || Error::Transport {
            status: 0,
            message: "All transport workers have stopped".to_string(),
        };
        match timeout {
            Some(t) if t.is_zero() => match self.responses.try_recv() {
                Ok(r) => Ok(Some(r)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(disconnected()),
            },
            Some(t) => match self.responses.recv_timeout(t) {
                Ok(r) => Ok(Some(r)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(disconnected()),
            },
            None => self.responses.recv().map(Some).map_err(|_| disconnected()),
        }
    }
}

impl Drop for ThreadedTransport {
    fn drop(&mut self) {
        // Closing the job channel ends each worker's loop
        self.jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Transport worker panicked");
            }
        }
    }
}
