use std::sync::Arc;

use rebuilder_common::protocol::{Request, Result};
use rebuilder_common::transport::{BuildListener, BuildStream};

use crate::worker::{Worker, WorkerConfig};

/// Accept loop for one worker process. Each connection carries exactly
/// one call and is handled on its own task, so a held-open `Acquire` or
/// a long `Wait` never blocks other callers.
pub struct WorkerServer {
    listener: BuildListener,
    worker: Arc<Worker>,
}

impl WorkerServer {
    /// Binds the listener and resolves the advertised address (the
    /// configured one, or the actual bound address).
    pub async fn bind(config: WorkerConfig) -> Result<Self> {
        let listener = BuildListener::bind(&config.listen).await?;
        let advertised = match &config.advertise {
            Some(addr) => addr.clone(),
            None => listener.local_addr()?,
        };
        tracing::info!(
            listen = %listener.local_addr()?,
            advertise = %advertised,
            capacity = config.concurrent_builds,
            "worker listening"
        );
        let worker = Arc::new(Worker::new(config, advertised));
        Ok(Self { listener, worker })
    }

    pub fn local_addr(&self) -> Result<String> {
        self.listener.local_addr()
    }

    pub fn worker(&self) -> Arc<Worker> {
        self.worker.clone()
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let mut stream = self.listener.accept().await?;
            let worker = self.worker.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(worker, &mut stream).await {
                    tracing::debug!("connection ended with error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection(worker: Arc<Worker>, stream: &mut BuildStream) -> Result<()> {
    // A peer that connects and goes away without a request is not an
    // error.
    let request: Request = match stream.try_recv().await? {
        Some(request) => request,
        None => return Ok(()),
    };
    worker.handle(stream, request).await
}
