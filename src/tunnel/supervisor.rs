//! Reconnect supervisor
//!
//! Sole owner of the transport session. Connections borrow the current
//! session through [`SessionSupervisor::acquire`]; when one of them reports
//! an abnormal failure the supervisor tears the session down and, if the
//! tunnel allows it, rebuilds it with a fixed backoff. The slot mutex makes
//! session replacement strictly sequential, so at most one live session
//! exists per tunnel at any time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::RECONNECT_DELAY;
use crate::error::TunnelError;
use crate::transport::{SessionController, SessionFactory};

pub struct SessionSupervisor {
    factory: Arc<dyn SessionFactory>,
    reconnect: bool,
    delay: Duration,
    slot: Mutex<Option<Arc<SessionController>>>,
}

impl SessionSupervisor {
    pub fn new(factory: Arc<dyn SessionFactory>, reconnect: bool) -> Self {
        Self::with_delay(factory, reconnect, RECONNECT_DELAY)
    }

    /// The fixed backoff is a parameter only so tests can shorten it.
    pub(crate) fn with_delay(
        factory: Arc<dyn SessionFactory>,
        reconnect: bool,
        delay: Duration,
    ) -> Self {
        Self {
            factory,
            reconnect,
            delay,
            slot: Mutex::new(None),
        }
    }

    /// First connection of the tunnel. Failures here are fatal: retrying is
    /// reserved for sessions that worked once.
    pub async fn connect_initial(&self) -> Result<Arc<SessionController>, TunnelError> {
        let mut slot = self.slot.lock().await;
        let session = Arc::new(self.factory.connect().await?);
        *slot = Some(session.clone());
        Ok(session)
    }

    /// The current session, or a freshly built one if the slot is empty or
    /// the session died.
    ///
    /// With reconnection enabled this retries forever on a fixed delay; the
    /// operator interrupts the process to give up. With reconnection
    /// disabled the first failure propagates.
    pub async fn acquire(&self) -> Result<Arc<SessionController>, TunnelError> {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_connected() {
                return Ok(session.clone());
            }
        }

        loop {
            match self.factory.connect().await {
                Ok(session) => {
                    info!("Transport session established");
                    let session = Arc::new(session);
                    *slot = Some(session.clone());
                    return Ok(session);
                }
                Err(e) if self.reconnect => {
                    eprintln!(
                        "Fail to reconnect, waiting {} seconds...",
                        self.delay.as_secs()
                    );
                    warn!("Reconnection attempt failed: {}", e);
                    sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop the session slot if it still holds the failed session.
    ///
    /// Pointer identity collapses concurrent failure reports into a single
    /// replacement: whoever reports a session that was already replaced
    /// leaves the new one alone.
    pub async fn invalidate(&self, failed: &Arc<SessionController>) {
        let mut slot = self.slot.lock().await;
        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(current, failed) {
                current.disconnect().await;
                *slot = None;
            }
        }
    }
}
