use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rebuilder_common::protocol::{LeaseId, RebuilderError, Result};
use tokio::process::Child;
use tokio::sync::oneshot;

/// Per-lease bookkeeping: the private working directory, the names of
/// uploaded input files (excluded when packaging artifacts), the running
/// build subprocess, and the signal that completes the held-open
/// `Acquire` call.
struct Lease {
    dir: PathBuf,
    uploaded: Vec<String>,
    child: Option<Child>,
    released: Option<oneshot::Sender<()>>,
}

/// Guarded table state: granted leases plus a count of slots reserved
/// by acquires that are still creating their working directory.
struct TableState {
    leases: HashMap<LeaseId, Lease>,
    reserved: usize,
}

/// The worker's one shared mutable structure, guarded by a single lock
/// held only for lookups and updates, never across filesystem calls.
///
/// A slot is reserved under the lock before its working directory is
/// created, so granted leases plus in-flight reservations can never
/// exceed the configured capacity.
pub struct LeaseTable {
    cache_dir: PathBuf,
    capacity: usize,
    state: Mutex<TableState>,
}

impl LeaseTable {
    pub fn new(cache_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            capacity,
            state: Mutex::new(TableState {
                leases: HashMap::new(),
                reserved: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Outstanding granted-and-not-released leases.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().leases.len()
    }

    /// Grants a new lease: fresh empty working directory, unique id.
    /// Fails as overloaded at capacity. The returned receiver resolves
    /// when the lease is released.
    pub fn acquire(&self) -> Result<(LeaseId, oneshot::Receiver<()>)> {
        {
            let mut state = self.state.lock().unwrap();
            if state.leases.len() + state.reserved >= self.capacity {
                return Err(RebuilderError::Overloaded(
                    "maximum concurrent builds reached".to_string(),
                ));
            }
            state.reserved += 1;
        }

        // Filesystem work happens with the lock dropped; the reservation
        // keeps the capacity bound intact meanwhile.
        let (id, dir) = match self.make_build_dir() {
            Ok(made) => made,
            Err(e) => {
                self.state.lock().unwrap().reserved -= 1;
                return Err(e);
            }
        };

        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.reserved -= 1;
        state.leases.insert(
            id.clone(),
            Lease {
                dir,
                uploaded: Vec::new(),
                child: None,
                released: Some(tx),
            },
        );
        Ok((id, rx))
    }

    fn make_build_dir(&self) -> Result<(LeaseId, PathBuf)> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let dir = tempfile::Builder::new()
            .prefix("build")
            .tempdir_in(&self.cache_dir)?
            .keep();
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                RebuilderError::Transport("build directory has no file name".to_string())
            })?;
        Ok((id, dir))
    }

    /// Frees the slot held by `id` and completes its `Acquire` call.
    /// Releasing an unknown or already-released id fails cleanly and
    /// never touches another lease.
    pub fn release(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let lease = state
            .leases
            .remove(id)
            .ok_or_else(|| RebuilderError::InvalidLease(id.to_string()))?;
        if let Some(tx) = lease.released {
            // The acquire handler may already be gone if the caller
            // disconnected; the freed capacity is what matters.
            let _ = tx.send(());
        }
        Ok(())
    }

    /// The working directory for a valid lease.
    pub fn dir(&self, id: &str) -> Result<PathBuf> {
        let state = self.state.lock().unwrap();
        state
            .leases
            .get(id)
            .map(|l| l.dir.clone())
            .ok_or_else(|| RebuilderError::InvalidLease(id.to_string()))
    }

    /// Records an uploaded input file name in the lease's transfer
    /// record.
    pub fn record_upload(&self, id: &str, filename: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let lease = state
            .leases
            .get_mut(id)
            .ok_or_else(|| RebuilderError::InvalidLease(id.to_string()))?;
        lease.uploaded.push(filename.to_string());
        Ok(())
    }

    /// Working directory plus the transfer record, for packaging.
    pub fn artifacts_view(&self, id: &str) -> Result<(PathBuf, Vec<String>)> {
        let state = self.state.lock().unwrap();
        let lease = state
            .leases
            .get(id)
            .ok_or_else(|| RebuilderError::InvalidLease(id.to_string()))?;
        Ok((lease.dir.clone(), lease.uploaded.clone()))
    }

    /// Stores the started build subprocess for a later `Wait`.
    pub fn store_child(&self, id: &str, child: Child) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let lease = state
            .leases
            .get_mut(id)
            .ok_or_else(|| RebuilderError::InvalidLease(id.to_string()))?;
        lease.child = Some(child);
        Ok(())
    }

    /// Takes the subprocess handle out of the lease so `Wait` can await
    /// it without holding the table lock.
    pub fn take_child(&self, id: &str) -> Result<Child> {
        let mut state = self.state.lock().unwrap();
        let lease = state
            .leases
            .get_mut(id)
            .ok_or_else(|| RebuilderError::InvalidLease(id.to_string()))?;
        lease
            .child
            .take()
            .ok_or_else(|| RebuilderError::NotFound(format!("no build started for {:?}", id)))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: usize) -> (tempfile::TempDir, LeaseTable) {
        let dir = tempfile::tempdir().unwrap();
        let table = LeaseTable::new(dir.path(), capacity);
        (dir, table)
    }

    #[test]
    fn grants_up_to_capacity_then_overloads() {
        let (_guard, table) = table(2);
        let (a, _rx_a) = table.acquire().unwrap();
        let (b, _rx_b) = table.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(table.outstanding(), 2);

        let err = table.acquire().unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn release_frees_a_slot() {
        let (_guard, table) = table(1);
        let (id, rx) = table.acquire().unwrap();
        assert!(table.acquire().is_err());

        table.release(&id).unwrap();
        assert_eq!(table.outstanding(), 0);
        assert!(rx.blocking_recv().is_ok());
        assert!(table.acquire().is_ok());
    }

    #[test]
    fn release_of_unknown_lease_fails_cleanly() {
        let (_guard, table) = table(1);
        let (id, _rx) = table.acquire().unwrap();

        assert!(table.release("bogus").is_err());
        // The stranger's failure must not have freed our slot.
        assert_eq!(table.outstanding(), 1);

        table.release(&id).unwrap();
        assert!(table.release(&id).is_err(), "double release must fail");
    }

    #[test]
    fn lease_directories_are_private_and_empty() {
        let (_guard, table) = table(2);
        let (a, _rx_a) = table.acquire().unwrap();
        let (b, _rx_b) = table.acquire().unwrap();
        let dir_a = table.dir(&a).unwrap();
        let dir_b = table.dir(&b).unwrap();
        assert_ne!(dir_a, dir_b);
        assert!(dir_a.is_dir());
        assert_eq!(std::fs::read_dir(&dir_a).unwrap().count(), 0);
    }

    #[test]
    fn transfer_record_accumulates() {
        let (_guard, table) = table(1);
        let (id, _rx) = table.acquire().unwrap();
        table.record_upload(&id, "a.deb").unwrap();
        table.record_upload(&id, "b.deb").unwrap();
        let (_dir, uploaded) = table.artifacts_view(&id).unwrap();
        assert_eq!(uploaded, vec!["a.deb".to_string(), "b.deb".to_string()]);
    }

    #[test]
    fn take_child_without_start_is_not_found() {
        let (_guard, table) = table(1);
        let (id, _rx) = table.acquire().unwrap();
        let err = table.take_child(&id).unwrap_err();
        assert!(matches!(err, RebuilderError::NotFound(_)));
    }

    #[test]
    fn a_failed_directory_creation_returns_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("cache");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let table = LeaseTable::new(&blocker, 1);
        assert!(matches!(
            table.acquire().unwrap_err(),
            RebuilderError::Io(_)
        ));
        assert_eq!(table.outstanding(), 0);

        // The slot is free again: the retry fails on the filesystem, not
        // as overloaded.
        let err = table.acquire().unwrap_err();
        assert!(!err.is_transient(), "{}", err);
    }

    /// Acquires racing from many threads still respect the capacity
    /// bound while working directories are being created.
    #[test]
    fn concurrent_acquires_respect_the_bound() {
        let (_guard, table) = table(4);
        let table = std::sync::Arc::new(table);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || table.acquire().is_ok()));
        }
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(granted, 4);
        assert_eq!(table.outstanding(), 4);
    }

    /// Randomized interleavings of acquire/release never violate the
    /// capacity bound.
    #[test]
    fn outstanding_leases_never_exceed_capacity() {
        use rand::Rng;

        let capacity = 4;
        let (_guard, table) = table(capacity);
        let mut rng = rand::thread_rng();
        let mut held: Vec<String> = Vec::new();

        for _ in 0..500 {
            if rng.gen_bool(0.6) {
                match table.acquire() {
                    Ok((id, _rx)) => held.push(id),
                    Err(err) => assert!(err.is_transient()),
                }
            } else if !held.is_empty() {
                let idx = rng.gen_range(0..held.len());
                let id = held.swap_remove(idx);
                table.release(&id).unwrap();
            }
            assert!(table.outstanding() <= capacity);
            assert_eq!(table.outstanding(), held.len());
        }
    }
}
