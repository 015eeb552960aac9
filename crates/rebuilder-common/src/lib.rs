//! Rebuilder Common Types and Transport
//!
//! This crate provides the wire protocol and framed transport shared by
//! every component of the rebuilder build farm: the worker (admission
//! control + build execution), the round-robin balancer, and the
//! client-side scheduler.
//!
//! # Wire protocol
//!
//! Every RPC call uses one dedicated connection (TCP or UNIX socket,
//! chosen by the form of the address). Messages are framed as:
//!
//! ```text
//! [4-byte length prefix as u32 big-endian] + [postcard data]
//! ```
//!
//! Frames are capped at [`transport::MAX_FRAME_SIZE`]; file data is
//! streamed in [`transport::CHUNK_SIZE`] chunks, which keeps every frame
//! safely under the ceiling. The cap is a wire-protocol constraint, not a
//! tunable.
//!
//! # Components
//!
//! - [`protocol`] - Request/Response messages and the shared error type
//! - [`transport`] - Framed codec, dialing, and listening over TCP/UNIX
//! - [`paths`] - File name containment check for lease directories

pub mod paths;
pub mod protocol;
pub mod transport;

pub use protocol::*;
