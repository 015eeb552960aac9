//! Rebuilder Transport Layer
//!
//! Framed message exchange over TCP or UNIX sockets.
//!
//! # Wire Format
//!
//! `[4-byte length prefix as u32 big-endian] + [postcard data]`
//!
//! Every frame is capped at [`MAX_FRAME_SIZE`] (4 MiB). File contents are
//! chunked at [`CHUNK_SIZE`] (3 MiB) so data frames always fit. These are
//! wire-protocol constraints shared by both ends, not tunables.
//!
//! # Address forms
//!
//! Addresses starting with `/` name UNIX socket paths; everything else is
//! dialed as TCP. [`BuildStream::dial`] and [`BuildListener::bind`] pick
//! the transport from the address alone, so workers behind a socket
//! directory and workers behind TCP ports look identical to callers.

pub mod codec;
pub mod stream;


pub use codec::{recv_frame, send_frame, try_recv_frame, CHUNK_SIZE, MAX_FRAME_SIZE};
pub use stream::{BuildListener, BuildStream};
