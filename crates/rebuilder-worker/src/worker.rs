use std::path::PathBuf;
use std::process::Stdio;

use rebuilder_common::paths::ensure_contained;
use rebuilder_common::protocol::{RebuilderError, Request, Response, Result, UploadFrame};
use rebuilder_common::transport::{BuildStream, CHUNK_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::lease::LeaseTable;

/// Distribution passed to the build command when the caller leaves it
/// empty.
const DEFAULT_DISTRIBUTION: &str = "sid";

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Listen address: a TCP `host:port` or an absolute UNIX socket
    /// path.
    pub listen: String,
    /// Address handed out in grants, at which this worker is reachable
    /// by build callers. Defaults to the bound listen address.
    pub advertise: Option<String>,
    /// Directory in which to build packages (can safely be deleted).
    pub cache_dir: PathBuf,
    /// Maximum number of builds to allow concurrently.
    pub concurrent_builds: usize,
    /// The build tool invoked per package. Managed purely as a
    /// subprocess: start, wait, exit status, captured output.
    pub build_command: String,
}

impl WorkerConfig {
    pub fn new(listen: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen: listen.into(),
            advertise: None,
            cache_dir: cache_dir.into(),
            concurrent_builds: 1,
            build_command: "sbuild".to_string(),
        }
    }
}

/// Request handlers for both worker-side services, sharing one lease
/// table.
pub struct Worker {
    leases: LeaseTable,
    advertised: String,
    build_command: String,
}

impl Worker {
    pub fn new(config: WorkerConfig, advertised: String) -> Self {
        Self {
            leases: LeaseTable::new(config.cache_dir, config.concurrent_builds),
            advertised,
            build_command: config.build_command,
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// Dispatches one call on its own connection. Streaming handlers
    /// manage their frames directly; unary handlers return a response
    /// which the caller of this function sends, mapping errors to error
    /// frames.
    pub async fn handle(&self, stream: &mut BuildStream, request: Request) -> Result<()> {
        let result = match request {
            Request::GetCapacity => Ok(Response::Capacity {
                concurrent_builds: self.leases.capacity() as u32,
            }),
            Request::Acquire => return self.handle_acquire(stream).await,
            Request::Release { lease_id } => self.handle_release(&lease_id),
            Request::Upload { lease_id, filename } => {
                return self.handle_upload(stream, &lease_id, &filename).await
            }
            Request::Start {
                lease_id,
                package,
                distribution,
                extra_artifacts,
            } => self.handle_start(&lease_id, &package, &distribution, &extra_artifacts),
            Request::Wait { lease_id } => self.handle_wait(&lease_id).await,
            Request::Download { lease_id } => return self.handle_download(stream, &lease_id).await,
            Request::Clean { lease_id } => Err(RebuilderError::Unimplemented(format!(
                "Clean({:?}): lease directories are garbage-collected out of band",
                lease_id
            ))),
        };

        match result {
            Ok(response) => stream.send(&response).await,
            Err(err) => stream.send(&Response::from_error(&err)).await,
        }
    }

    /// Grants a lease and keeps the call open until release or caller
    /// disconnect.
    async fn handle_acquire(&self, stream: &mut BuildStream) -> Result<()> {
        let (lease_id, released) = match self.leases.acquire() {
            Ok(grant) => grant,
            Err(err) => return stream.send(&Response::from_error(&err)).await,
        };
        tracing::info!(lease = %lease_id, "lease acquired");

        stream
            .send(&Response::Granted {
                lease_id: lease_id.clone(),
                worker_addr: self.advertised.clone(),
            })
            .await?;

        // The open call is the lease's liveness channel: it ends when
        // Release fires the per-lease signal, or when the caller goes
        // away. A disconnecting caller does NOT free the lease; DESIGN.md
        // flags the resulting capacity leak as an open question.
        let mut eof = [0u8; 1];
        tokio::select! {
            _ = released => {
                tracing::info!(lease = %lease_id, "lease released, completing acquire call");
            }
            _ = stream.read(&mut eof) => {
                tracing::warn!(lease = %lease_id, "caller disconnected from open acquire call");
            }
        }
        Ok(())
    }

    fn handle_release(&self, lease_id: &str) -> Result<Response> {
        self.leases.release(lease_id)?;
        tracing::info!(lease = %lease_id, "lease released");
        Ok(Response::Ack)
    }

    /// Receives one file into the lease directory. The destination name
    /// is validated before any byte is written.
    async fn handle_upload(
        &self,
        stream: &mut BuildStream,
        lease_id: &str,
        filename: &str,
    ) -> Result<()> {
        let path = match self.prepare_upload(lease_id, filename) {
            Ok(path) => path,
            Err(err) => return stream.send(&Response::from_error(&err)).await,
        };

        let mut file = match tokio::fs::File::create(&path).await {
            Ok(file) => file,
            Err(err) => {
                return stream
                    .send(&Response::from_error(&RebuilderError::Io(err)))
                    .await
            }
        };

        loop {
            match stream.recv::<UploadFrame>().await? {
                UploadFrame::Chunk(data) => file.write_all(&data).await?,
                UploadFrame::Done => break,
            }
        }
        file.flush().await?;
        tracing::debug!(lease = %lease_id, file = %filename, "upload complete");

        stream.send(&Response::Ack).await
    }

    fn prepare_upload(&self, lease_id: &str, filename: &str) -> Result<PathBuf> {
        let dir = self.leases.dir(lease_id)?;
        ensure_contained(filename)?;
        self.leases.record_upload(lease_id, filename)?;
        Ok(dir.join(filename))
    }

    /// Validates the build request, assembles the build-tool invocation,
    /// and launches it detached. Returns as soon as the process started.
    fn handle_start(
        &self,
        lease_id: &str,
        package: &str,
        distribution: &str,
        extra_artifacts: &[String],
    ) -> Result<Response> {
        let dir = self.leases.dir(lease_id)?;

        if package.trim().is_empty() {
            return Err(RebuilderError::InvalidRequest(
                "no package to build specified".to_string(),
            ));
        }

        let dist = if distribution.is_empty() {
            DEFAULT_DISTRIBUTION
        } else {
            distribution
        };

        let mut args = vec!["--arch-all".to_string(), format!("--dist={}", dist)];
        for name in extra_artifacts {
            ensure_contained(name)?;
            args.push(format!("--extra-package={}", name));
        }
        args.push(package.to_string());

        let stdout = std::fs::File::create(dir.join("STDOUT"))?;
        let stderr = std::fs::File::create(dir.join("STDERR"))?;

        let child = tokio::process::Command::new(&self.build_command)
            .args(&args)
            .current_dir(&dir)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| {
                RebuilderError::Transport(format!(
                    "failed to start {:?}: {}",
                    self.build_command, e
                ))
            })?;
        tracing::info!(lease = %lease_id, package = %package, "build started");

        self.leases.store_child(lease_id, child)?;
        Ok(Response::Ack)
    }

    /// Blocks until the started subprocess exits.
    async fn handle_wait(&self, lease_id: &str) -> Result<Response> {
        let mut child = self.leases.take_child(lease_id)?;
        let status = child.wait().await?;
        let code = status.code().unwrap_or(-1);
        tracing::info!(lease = %lease_id, status = code, "build finished");
        Ok(Response::Exited { status: code })
    }

    /// Packages the lease directory, excluding uploaded inputs, and
    /// streams it back as chunks of a compressed tar archive.
    async fn handle_download(&self, stream: &mut BuildStream, lease_id: &str) -> Result<()> {
        let (dir, uploaded) = match self.leases.artifacts_view(lease_id) {
            Ok(view) => view,
            Err(err) => return stream.send(&Response::from_error(&err)).await,
        };

        // Archive creation is an external collaborator; the contract is
        // only "produce a compressed tar byte stream".
        let mut cmd = tokio::process::Command::new("tar");
        cmd.arg("cz");
        for name in &uploaded {
            cmd.arg(format!("--exclude=./{}", name));
        }
        cmd.arg(".")
            .current_dir(&dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn()?;
        let mut out = child
            .stdout
            .take()
            .ok_or_else(|| RebuilderError::Transport("tar stdout unavailable".to_string()))?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = out.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.send(&Response::Chunk(buf[..n].to_vec())).await?;
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(RebuilderError::Transport(format!(
                "tar exited with {}",
                status
            )));
        }
        stream.send(&Response::Done).await
    }
}
