//! Rebuilder RPC Messages
//!
//! One `Request` frame opens every call; the server answers with one or
//! more `Response` frames. Two calls stream additional data:
//!
//! - `Upload` is followed by client-sent [`UploadFrame`]s until `Done`.
//! - `Download` is answered by `Response::Chunk` frames, then `Done`.
//! - `Acquire` is answered by one `Granted` frame, after which the
//!   connection is held open until the lease is released or the caller
//!   disconnects. The open call doubles as a liveness channel for the
//!   lease.

use serde::{Deserialize, Serialize};

use super::error::{ErrorKind, RebuilderError, Result};

/// Opaque identifier naming one granted build slot and its private
/// working directory on the worker.
pub type LeaseId = String;

/// A request frame opening one RPC call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Request {
    /// Read the endpoint's configured concurrency capacity.
    GetCapacity,
    /// Ask for a build lease. Granted immediately or refused as
    /// `Overloaded`; there is no queuing on the worker.
    Acquire,
    /// Free the slot held by `lease_id`, completing the matching
    /// `Acquire` call.
    Release { lease_id: LeaseId },
    /// Write a file into the lease's working directory. Followed by
    /// [`UploadFrame`]s carrying the file contents.
    Upload { lease_id: LeaseId, filename: String },
    /// Launch the build subprocess inside the lease directory. Returns
    /// as soon as the process has started.
    Start {
        lease_id: LeaseId,
        package: String,
        /// Target distribution; the worker defaults it when empty.
        distribution: String,
        /// File names (already uploaded) to inject into the build.
        extra_artifacts: Vec<String>,
    },
    /// Block until the started subprocess exits.
    Wait { lease_id: LeaseId },
    /// Stream back the lease directory as a compressed tar archive,
    /// excluding uploaded input files.
    Download { lease_id: LeaseId },
    /// Reserved for explicit working-directory teardown.
    Clean { lease_id: LeaseId },
}

/// Client-streamed file contents following a `Request::Upload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum UploadFrame {
    Chunk(Vec<u8>),
    Done,
}

/// A server-sent frame answering a request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Response {
    Capacity {
        concurrent_builds: u32,
    },
    /// The grant: a fresh lease plus the address at which the build
    /// calls must be made (the granting worker, never the balancer).
    Granted {
        lease_id: LeaseId,
        worker_addr: String,
    },
    Ack,
    Exited {
        status: i32,
    },
    Chunk(Vec<u8>),
    Done,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    /// Wraps a local error for the wire.
    pub fn from_error(err: &RebuilderError) -> Self {
        Response::Error {
            kind: err.wire_kind(),
            message: err.to_string(),
        }
    }

    /// Turns an `Error` frame back into a local error, passing every
    /// other frame through.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error { kind, message } => Err(RebuilderError::from_wire(kind, message)),
            other => Ok(other),
        }
    }
}
