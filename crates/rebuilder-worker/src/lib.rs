//! Rebuilder Worker
//!
//! One worker process per build machine. It serves two co-located
//! concerns over a single listener:
//!
//! - **Admission control**: a hard cap on concurrently active builds,
//!   handed out as leases. `Acquire` either grants immediately or fails
//!   as overloaded; there is no queuing. The granted call stays open
//!   until the matching `Release`, doubling as a liveness channel.
//! - **Build execution**: given a lease, accept input files, launch the
//!   build command as a detached subprocess, report its exit status, and
//!   stream back the produced artifact tree as a compressed tar archive
//!   (excluding the uploaded inputs).
//!
//! Each lease is backed by a private working directory under the cache
//! root. Directories are not deleted on release; the cache root can be
//! cleaned out of band at any time.

pub mod lease;
pub mod server;
pub mod worker;

pub use lease::LeaseTable;
pub use server::WorkerServer;
pub use worker::{Worker, WorkerConfig};
