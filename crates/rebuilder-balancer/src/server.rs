use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rebuilder_common::protocol::{RebuilderError, Request, Response, Result};
use rebuilder_common::transport::{BuildListener, BuildStream};
use tokio::io::AsyncReadExt;

use crate::picker::RoundRobin;
use crate::resolver::{spawn_resolver, AddressSource, SocketDirScanner, StaticAddresses};

/// Configuration for the forwarding balancer.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub listen: String,
    /// Fixed, statically configured worker addresses.
    pub static_backends: Vec<String>,
    /// Directory of dynamically appearing worker UNIX sockets.
    pub socket_dir: Option<PathBuf>,
    /// Operator-configured aggregate capacity across the balanced pool:
    /// the sum of the workers' concurrent-build limits, as a static
    /// estimate. Not computed by querying backends.
    pub concurrent_builds: u32,
    /// Backend discovery polling interval.
    pub poll_interval: Duration,
}

impl BalancerConfig {
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            static_backends: Vec::new(),
            socket_dir: None,
            concurrent_builds: 32,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// The admission forwarder. Terminates `GetCapacity` itself, forwards
/// `Acquire` in round-robin order, and refuses everything else.
pub struct BalancerServer {
    listener: BuildListener,
    picker: Arc<Mutex<RoundRobin>>,
    concurrent_builds: u32,
    _resolver: tokio::task::JoinHandle<()>,
}

impl BalancerServer {
    pub async fn bind(config: BalancerConfig) -> Result<Self> {
        let listener = BuildListener::bind(&config.listen).await?;

        let picker = Arc::new(Mutex::new(RoundRobin::new(Vec::new())));
        let mut sources: Vec<Box<dyn AddressSource>> = vec![Box::new(StaticAddresses::new(
            config.static_backends.clone(),
        ))];
        if let Some(dir) = &config.socket_dir {
            sources.push(Box::new(SocketDirScanner::new(dir.clone())));
        }
        let resolver = spawn_resolver(picker.clone(), sources, config.poll_interval);

        tracing::info!(
            listen = %listener.local_addr()?,
            static_backends = config.static_backends.len(),
            capacity = config.concurrent_builds,
            "balancer listening"
        );

        Ok(Self {
            listener,
            picker,
            concurrent_builds: config.concurrent_builds,
            _resolver: resolver,
        })
    }

    pub fn local_addr(&self) -> Result<String> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let mut stream = self.listener.accept().await?;
            let picker = self.picker.clone();
            let capacity = self.concurrent_builds;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(picker, capacity, &mut stream).await {
                    tracing::debug!("connection ended with error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection(
    picker: Arc<Mutex<RoundRobin>>,
    capacity: u32,
    stream: &mut BuildStream,
) -> Result<()> {
    let request: Request = match stream.try_recv().await? {
        Some(request) => request,
        None => return Ok(()),
    };

    match request {
        Request::GetCapacity => {
            stream
                .send(&Response::Capacity {
                    concurrent_builds: capacity,
                })
                .await
        }
        Request::Acquire => forward_acquire(picker, stream).await,
        _ => {
            // The balancer's role ends at the admission handshake.
            stream
                .send(&Response::from_error(&RebuilderError::Unimplemented(
                    "dial the granted worker address for any call but Acquire".to_string(),
                )))
                .await
        }
    }
}

/// Forwards one `Acquire` to the next backend. The grant's worker
/// address is rewritten to the backend actually dialed, so the caller
/// bypasses the balancer for the rest of the lease's life. Afterwards
/// both connections are held until either side closes, keeping the
/// caller's liveness channel wired through to the worker.
async fn forward_acquire(
    picker: Arc<Mutex<RoundRobin>>,
    caller: &mut BuildStream,
) -> Result<()> {
    let backend = picker.lock().unwrap().next_backend();
    let Some(backend) = backend else {
        return caller
            .send(&Response::from_error(&RebuilderError::Overloaded(
                "no backends available".to_string(),
            )))
            .await;
    };

    let mut upstream = match BuildStream::open(&backend, &Request::Acquire).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(backend = %backend, "failed to dial backend: {}", e);
            return caller.send(&Response::from_error(&e)).await;
        }
    };

    let first: Response = upstream.recv().await?;
    let relayed = match first {
        Response::Granted { lease_id, .. } => {
            tracing::info!(backend = %backend, lease = %lease_id, "forwarded acquire");
            Response::Granted {
                lease_id,
                worker_addr: backend.clone(),
            }
        }
        other => other,
    };
    let granted = matches!(relayed, Response::Granted { .. });
    caller.send(&relayed).await?;

    if granted {
        let mut upstream_eof = [0u8; 1];
        let mut caller_eof = [0u8; 1];
        tokio::select! {
            _ = upstream.read(&mut upstream_eof) => {
                tracing::debug!(backend = %backend, "backend closed forwarded acquire");
            }
            _ = caller.read(&mut caller_eof) => {
                tracing::debug!(backend = %backend, "caller closed forwarded acquire");
            }
        }
    }
    Ok(())
}
