//! One package's trip through a build lease.
//!
//! Every call opens a fresh connection to the endpoint, except the
//! grant itself: the `Acquire` connection stays open for the lease's
//! whole life and is only dropped after `Release`, so the worker can
//! watch it for caller liveness.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use rebuilder_common::protocol::{LeaseId, RebuilderError, Request, Response, Result, UploadFrame};
use rebuilder_common::transport::{BuildStream, CHUNK_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One package to rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildJob {
    pub package: String,
    pub version: String,
}

impl BuildJob {
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
        }
    }

    /// The `name_version` form used for the build invocation and for
    /// naming the package's output directory.
    pub fn spec(&self) -> String {
        format!("{}_{}", self.package, self.version)
    }
}

/// A granted lease plus the open admission call backing it.
pub struct Lease {
    pub lease_id: LeaseId,
    pub worker_addr: String,
    _conn: BuildStream,
}

/// Asks the admission endpoint for a lease. On success the returned
/// [`Lease`] holds the admission connection open; all further calls go
/// directly to `worker_addr`.
pub async fn acquire(endpoint: &str) -> Result<Lease> {
    let mut conn = BuildStream::open(endpoint, &Request::Acquire).await?;
    let response: Response = conn.recv().await?;
    match response.into_result()? {
        Response::Granted {
            lease_id,
            worker_addr,
        } => Ok(Lease {
            lease_id,
            worker_addr,
            _conn: conn,
        }),
        other => Err(RebuilderError::Protocol(format!(
            "expected a grant, got {:?}",
            other
        ))),
    }
}

/// Frees the lease's slot on the worker. The held admission connection
/// is closed when the [`Lease`] is dropped afterwards.
pub async fn release(lease: &Lease) -> Result<()> {
    let response = BuildStream::roundtrip(
        &lease.worker_addr,
        &Request::Release {
            lease_id: lease.lease_id.clone(),
        },
    )
    .await?;
    match response {
        Response::Ack => Ok(()),
        other => Err(RebuilderError::Protocol(format!(
            "expected an ack, got {:?}",
            other
        ))),
    }
}

/// Runs one full build inside an already-granted lease: upload the
/// artifacts, start, wait, download the produced tree into `dest`.
/// Returns the build's exit status.
pub async fn run_build(
    lease: &Lease,
    spec: &str,
    distribution: &str,
    artifacts: &[PathBuf],
    dest: &Path,
) -> Result<i32> {
    let mut artifact_names = Vec::with_capacity(artifacts.len());
    for path in artifacts {
        artifact_names.push(upload_file(lease, path).await?);
    }

    BuildStream::roundtrip(
        &lease.worker_addr,
        &Request::Start {
            lease_id: lease.lease_id.clone(),
            package: spec.to_string(),
            distribution: distribution.to_string(),
            extra_artifacts: artifact_names,
        },
    )
    .await?;

    let response = BuildStream::roundtrip(
        &lease.worker_addr,
        &Request::Wait {
            lease_id: lease.lease_id.clone(),
        },
    )
    .await?;
    let status = match response {
        Response::Exited { status } => status,
        other => {
            return Err(RebuilderError::Protocol(format!(
                "expected an exit status, got {:?}",
                other
            )))
        }
    };

    download_into(lease, dest).await?;
    Ok(status)
}

/// Streams one local file into the lease's working directory and
/// returns the name it was stored under.
async fn upload_file(lease: &Lease, path: &Path) -> Result<String> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            RebuilderError::InvalidRequest(format!("artifact path {:?} has no file name", path))
        })?
        .to_string();

    let mut file = tokio::fs::File::open(path).await?;
    let mut conn = BuildStream::open(
        &lease.worker_addr,
        &Request::Upload {
            lease_id: lease.lease_id.clone(),
            filename: filename.clone(),
        },
    )
    .await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        conn.send(&UploadFrame::Chunk(buf[..n].to_vec())).await?;
    }
    conn.send(&UploadFrame::Done).await?;

    let response: Response = conn.recv().await?;
    response.into_result()?;
    Ok(filename)
}

/// Downloads the lease's artifact tree and unpacks it into `dest`,
/// atomically replacing any existing directory of that name. The
/// archive is piped straight into the extractor, never buffered whole.
async fn download_into(lease: &Lease, dest: &Path) -> Result<()> {
    let parent = dest.parent().ok_or_else(|| {
        RebuilderError::InvalidRequest(format!("output directory {:?} has no parent", dest))
    })?;
    let name = dest.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        RebuilderError::InvalidRequest(format!("output directory {:?} has no name", dest))
    })?;
    let staging = parent.join(format!(".{}", name));

    match tokio::fs::remove_dir_all(&staging).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(&staging).await?;

    let mut untar = tokio::process::Command::new("tar")
        .arg("xz")
        .current_dir(&staging)
        .stdin(Stdio::piped())
        .spawn()?;
    let mut stdin = untar
        .stdin
        .take()
        .ok_or_else(|| RebuilderError::Transport("extractor has no stdin".to_string()))?;

    let mut conn = BuildStream::open(
        &lease.worker_addr,
        &Request::Download {
            lease_id: lease.lease_id.clone(),
        },
    )
    .await?;
    loop {
        let frame: Response = conn.recv().await?;
        match frame.into_result()? {
            Response::Chunk(data) => stdin.write_all(&data).await?,
            Response::Done => break,
            other => {
                return Err(RebuilderError::Protocol(format!(
                    "unexpected download frame {:?}",
                    other
                )))
            }
        }
    }
    drop(stdin);

    let status = untar.wait().await?;
    if !status.success() {
        return Err(RebuilderError::Transport(format!(
            "archive extraction exited with {}",
            status
        )));
    }

    match tokio::fs::remove_dir_all(dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::rename(&staging, dest).await?;
    Ok(())
}
