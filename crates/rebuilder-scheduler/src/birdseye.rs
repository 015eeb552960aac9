//! One-line live progress view.
//!
//! Tracks one state symbol per concurrency-token slot (not per
//! package) and re-renders a single overwritten status line on a fixed
//! interval. Purely observational; it never affects scheduling.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What the task currently occupying a slot is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Queued,
    Acquiring,
    Running,
    Erroring,
    Done,
}

// Running slots cycle through this by wall-clock second.
const SPINNER: &[u8] = b".oOo.";

impl SlotState {
    fn symbol(self, seconds: u64) -> char {
        match self {
            SlotState::Idle => '_',
            SlotState::Queued => '.',
            SlotState::Acquiring => '?',
            SlotState::Running => SPINNER[(seconds as usize) % SPINNER.len()] as char,
            SlotState::Erroring => '!',
            SlotState::Done => '=',
        }
    }
}

pub struct Birdseye {
    slots: Mutex<Vec<SlotState>>,
    done: AtomicUsize,
    total: usize,
}

impl Birdseye {
    pub fn new(slots: usize, total: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![SlotState::Idle; slots]),
            done: AtomicUsize::new(0),
            total,
        })
    }

    /// Takes ownership of a free slot. The caller already holds a
    /// concurrency token, so a free slot always exists.
    pub fn claim(&self) -> usize {
        let mut slots = self.slots.lock().unwrap();
        match slots.iter().position(|s| *s == SlotState::Idle) {
            Some(slot) => {
                slots[slot] = SlotState::Queued;
                slot
            }
            None => {
                slots.push(SlotState::Queued);
                slots.len() - 1
            }
        }
    }

    pub fn set(&self, slot: usize, state: SlotState) {
        self.slots.lock().unwrap()[slot] = state;
    }

    pub fn release(&self, slot: usize) {
        self.slots.lock().unwrap()[slot] = SlotState::Idle;
    }

    /// Records one package as fully classified.
    pub fn package_done(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    /// The status line as rendered at the given wall-clock second.
    pub fn render_at(&self, seconds: u64) -> String {
        let slots = self.slots.lock().unwrap();
        let symbols: String = slots.iter().map(|s| s.symbol(seconds)).collect();
        format!(
            "[{}] {}/{} done",
            symbols,
            self.done.load(Ordering::Relaxed),
            self.total
        )
    }

    /// Spawns the render loop, overwriting one stderr line per tick.
    pub fn spawn(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let seconds = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let mut stderr = std::io::stderr();
                let _ = write!(stderr, "\r{}", self.render_at(seconds));
                let _ = stderr.flush();
            }
        })
    }
}
