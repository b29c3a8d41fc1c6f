//! Background writer for dirty, unpinned pages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::BufferPool;
use crate::error::{Result, StorageError};

/// Shutdown signal shared with the flusher thread.
struct Signal {
    shutdown: Mutex<bool>,
    cond: Condvar,
}

/// Periodically writes back dirty frames that nobody has pinned.
///
/// It never evicts; it only keeps future eviction victims clean. The thread
/// lives until [`stop`](Self::stop) is called or the flusher is dropped.
pub struct BackgroundFlusher {
    signal: Arc<Signal>,
    handle: Mutex<Option<JoinHandle<()>>>,
    rounds: Arc<AtomicU64>,
}

impl BackgroundFlusher {
    /// Spawns the flusher thread.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the thread cannot be spawned.
    pub fn start(pool: Arc<BufferPool>, interval: Duration) -> Result<Self> {
        let signal = Arc::new(Signal {
            shutdown: Mutex::new(false),
            cond: Condvar::new(),
        });
        let rounds = Arc::new(AtomicU64::new(0));

        let thread_signal = Arc::clone(&signal);
        let thread_rounds = Arc::clone(&rounds);
        let handle = thread::Builder::new()
            .name("ruzu-page-flusher".to_string())
            .spawn(move || flush_loop(&pool, &thread_signal, &thread_rounds, interval))
            .map_err(|e| StorageError::IoError(format!("Failed to spawn flusher thread: {e}")))?;

        debug!(?interval, "background flusher started");
        Ok(Self {
            signal,
            handle: Mutex::new(Some(handle)),
            rounds,
        })
    }

    /// Returns how many flush rounds have completed.
    #[must_use]
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    /// Signals the thread to stop and waits for it to finish its current round.
    pub fn stop(&self) {
        {
            let mut shutdown = self.signal.shutdown.lock();
            *shutdown = true;
            self.signal.cond.notify_all();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("background flusher panicked");
            }
            debug!("background flusher stopped");
        }
    }
}

impl Drop for BackgroundFlusher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn flush_loop(pool: &BufferPool, signal: &Signal, rounds: &AtomicU64, interval: Duration) {
    loop {
        {
            let mut shutdown = signal.shutdown.lock();
            if !*shutdown {
                signal.cond.wait_for(&mut shutdown, interval);
            }
            if *shutdown {
                break;
            }
        }

        match pool.flush_unpinned() {
            Ok(0) => {}
            Ok(written) => debug!(written, "background flush wrote pages"),
            Err(e) => warn!(error = %e, "background flush failed"),
        }
        rounds.fetch_add(1, Ordering::Relaxed);
    }
}
