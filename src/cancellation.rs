//! Epoch tracking for facade resolutions.
//! Each language or text-set change opens a new epoch and cancels the
//! previous one, so a late result for an old language can never overwrite
//! the current view.
//!
//! Only the listener stops; the upstream batch it was waiting on keeps
//! running and still fills the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Epoch counter owned by one facade.
pub struct ResolutionEpochs {
    latest: Arc<AtomicU64>,
    live: Mutex<CancellationToken>,
}

impl Default for ResolutionEpochs {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionEpochs {
    pub fn new() -> Self {
        Self {
            latest: Arc::new(AtomicU64::new(0)),
            live: Mutex::new(CancellationToken::new()),
        }
    }

    /// Close the current epoch and open the next one.
    pub fn begin(&self) -> EpochGuard {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.live.lock(), token.clone());
        previous.cancel();
        EpochGuard {
            epoch: self.latest.fetch_add(1, Ordering::SeqCst) + 1,
            latest: Arc::clone(&self.latest),
            token,
        }
    }

    pub fn latest(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    /// Close the current epoch without opening another (facade teardown).
    pub fn close(&self) {
        self.live.lock().cancel();
    }
}

/// Carried by a resolution task; checked before every write to facade state.
#[derive(Clone, Debug)]
pub struct EpochGuard {
    epoch: u64,
    latest: Arc<AtomicU64>,
    token: CancellationToken,
}

impl EpochGuard {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Still the newest epoch and not closed.
    pub fn is_live(&self) -> bool {
        !self.token.is_cancelled() && self.latest.load(Ordering::SeqCst) == self.epoch
    }

    /// Resolves once this epoch is superseded or closed.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}
