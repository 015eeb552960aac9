//! File name containment for lease working directories.

use std::path::{Component, Path};

use crate::protocol::error::{RebuilderError, Result};

/// Checks that `name`, joined onto a lease directory, stays inside that
/// directory after lexical normalization.
///
/// The check runs before any filesystem effect: uploads are rejected
/// before a single byte is written, and injected artifact names are
/// rejected before the build command is assembled. Absolute paths and
/// any `..` that would climb out of the directory fail.
pub fn ensure_contained(name: &str) -> Result<()> {
    let path = Path::new(name);
    if path.is_absolute() {
        return Err(RebuilderError::PathTraversal(name.to_string()));
    }

    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(RebuilderError::PathTraversal(name.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(RebuilderError::PathTraversal(name.to_string()));
            }
        }
    }

    if depth == 0 {
        // "", "." and fully self-cancelling names don't name a file.
        return Err(RebuilderError::PathTraversal(name.to_string()));
    }

    Ok(())
}
