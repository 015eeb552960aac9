//! Rebuilder Balancer
//!
//! A stateless intermediary presenting one stable admission-control
//! endpoint backed by a changing set of real workers. It forwards
//! `Acquire` calls to backends in round-robin order and rewrites the
//! grant's worker address to the backend that answered, so the caller
//! performs every subsequent call on that lease directly against the
//! granting worker. The balancer's role ends at the admission handshake:
//! `Release` and all build calls answer as unimplemented.
//!
//! Backend membership combines a static address list with a polled
//! directory of UNIX sockets; see [`resolver`].

pub mod picker;
pub mod resolver;
pub mod server;

pub use picker::RoundRobin;
pub use resolver::{AddressSource, AddressUpdate, SocketDirScanner, StaticAddresses};
pub use server::{BalancerConfig, BalancerServer};
