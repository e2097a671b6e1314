//! Connection ID generation
//!
//! IDs must be unique for the lifetime of the process and handed out in
//! acceptance order. A single generator task emits successive integers into
//! a bounded channel; receivers pop under a mutex, so the hand-off itself
//! orders concurrent callers without a bare shared counter.

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Source of strictly increasing connection IDs, starting at 1.
pub struct ConnectionIds {
    rx: Mutex<mpsc::Receiver<u64>>,
}

impl ConnectionIds {
    /// Spawn the generator task and return the shared source.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut next: u64 = 1;
            while tx.send(next).await.is_ok() {
                next += 1;
            }
            debug!("Connection ID generator stopped after {} ids", next - 1);
        });
        Self { rx: Mutex::new(rx) }
    }

    /// Take the next ID. Returns `None` only once the generator task is
    /// gone, which cannot happen while the source itself is alive.
    pub async fn next(&self) -> Option<u64> {
        self.rx.lock().await.recv().await
    }
}
