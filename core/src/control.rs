use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const SIGNAL_NONE: u8 = 0;
const SIGNAL_PAUSE: u8 = 1;
const SIGNAL_CANCEL: u8 = 2;
const SIGNAL_TIMEOUT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    Pause,
    Cancel,
    Timeout,
}

/// Cooperative stop flag shared between the manager, the pool and the
/// running handler. Checked at every chunk boundary.
#[derive(Debug, Clone, Default)]
pub struct TaskControl {
    flag: Arc<AtomicU8>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.raise(SIGNAL_PAUSE);
    }

    /// Cancel wins over any earlier signal.
    pub fn cancel(&self) {
        self.flag.store(SIGNAL_CANCEL, Ordering::SeqCst);
    }

    pub fn timeout(&self) {
        self.raise(SIGNAL_TIMEOUT);
    }

    pub fn reset(&self) {
        self.flag.store(SIGNAL_NONE, Ordering::SeqCst);
    }

    pub fn signal(&self) -> Signal {
        match self.flag.load(Ordering::SeqCst) {
            SIGNAL_PAUSE => Signal::Pause,
            SIGNAL_CANCEL => Signal::Cancel,
            SIGNAL_TIMEOUT => Signal::Timeout,
            _ => Signal::None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.signal() != Signal::None
    }

    // A pause or timeout never downgrades a pending cancel.
    fn raise(&self, value: u8) {
        let _ = self.flag.compare_exchange(
            SIGNAL_NONE,
            value,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
