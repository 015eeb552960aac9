//! Backend address discovery.
//!
//! An [`AddressSource`] reports membership changes over time; the
//! resolver task polls every source on a fixed interval (not
//! event-driven) and applies the deltas to the shared round-robin
//! picker. Two sources exist: a fixed address list and a watched
//! directory of UNIX sockets.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rebuilder_common::protocol::Result;

use crate::picker::RoundRobin;

/// A single membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressUpdate {
    Add(String),
    Remove(String),
}

/// Something that can be polled for backend membership changes.
///
/// Implementations must report deltas only when the set actually
/// changed; a no-op poll returns an empty vector.
pub trait AddressSource: Send {
    fn poll(&mut self) -> Result<Vec<AddressUpdate>>;
}

/// A set of addresses which never changes: emitted once on the first
/// poll, nothing afterwards.
pub struct StaticAddresses {
    addrs: Vec<String>,
    emitted: bool,
}

impl StaticAddresses {
    pub fn new(addrs: Vec<String>) -> Self {
        Self {
            addrs,
            emitted: false,
        }
    }
}

impl AddressSource for StaticAddresses {
    fn poll(&mut self) -> Result<Vec<AddressUpdate>> {
        if self.emitted {
            return Ok(Vec::new());
        }
        self.emitted = true;
        Ok(self
            .addrs
            .iter()
            .cloned()
            .map(AddressUpdate::Add)
            .collect())
    }
}

/// Watches a directory for UNIX sockets of dynamically appearing
/// workers. Each poll lists the directory, keeps only socket entries,
/// and diffs against the previously known set.
pub struct SocketDirScanner {
    dir: PathBuf,
    known: BTreeSet<String>,
}

impl SocketDirScanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            known: BTreeSet::new(),
        }
    }
}

impl AddressSource for SocketDirScanner {
    fn poll(&mut self) -> Result<Vec<AddressUpdate>> {
        use std::os::unix::fs::FileTypeExt;

        let mut current = BTreeSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_socket() {
                continue;
            }
            current.insert(self.dir.join(entry.file_name()).to_string_lossy().into_owned());
        }

        if current == self.known {
            return Ok(Vec::new());
        }

        let mut updates = Vec::new();
        for gone in self.known.difference(&current) {
            updates.push(AddressUpdate::Remove(gone.clone()));
        }
        for added in current.difference(&self.known) {
            updates.push(AddressUpdate::Add(added.clone()));
        }
        self.known = current;
        Ok(updates)
    }
}

/// Spawns the polling loop that keeps `picker` in sync with all
/// sources.
pub fn spawn_resolver(
    picker: Arc<Mutex<RoundRobin>>,
    mut sources: Vec<Box<dyn AddressSource>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for source in &mut sources {
                let updates = match source.poll() {
                    Ok(updates) => updates,
                    Err(e) => {
                        tracing::warn!("address source poll failed: {}", e);
                        continue;
                    }
                };
                if updates.is_empty() {
                    continue;
                }
                let mut picker = picker.lock().unwrap();
                for update in updates {
                    match update {
                        AddressUpdate::Add(addr) => {
                            tracing::info!(backend = %addr, "backend added");
                            picker.add_backend(addr);
                        }
                        AddressUpdate::Remove(addr) => {
                            tracing::info!(backend = %addr, "backend removed");
                            picker.remove_backend(&addr);
                        }
                    }
                }
            }
        }
    })
}
