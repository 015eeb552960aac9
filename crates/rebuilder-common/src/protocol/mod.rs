pub mod error;
pub mod messages;

#[cfg(test)]
mod tests;

pub use error::{ErrorKind, RebuilderError, Result};
pub use messages::{LeaseId, Request, Response, UploadFrame};
