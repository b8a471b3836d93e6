//! Outbound NOTIFY dispatch queue
//!
//! Request handlers enqueue fully built NOTIFYs and return immediately; a
//! single worker task drains the queue in FIFO order and hands each request to
//! the transport. One worker means one global order, which is what keeps the
//! versions of a single subscription strictly increasing on the wire.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rvoip_sip_core::Request;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{NotifierError, Result};
use crate::transport::{SipEndPoint, Transport};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A request waiting to be sent
#[derive(Debug, Clone)]
pub struct OutboundNotify {
    pub destination: SipEndPoint,
    pub request: Request,
}

/// Asynchronous send queue in front of the transport
pub struct NotifyQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<OutboundNotify>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotifyQueue {
    /// Create the queue and spawn its worker
    pub fn start(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutboundNotify>();

        let worker = tokio::spawn(async move {
            while let Some(notify) = rx.recv().await {
                let method = notify.request.method();
                if let Err(e) = transport.send_request(notify.destination, notify.request).await {
                    warn!("Failed to send {} to {}: {}", method, notify.destination, e);
                } else {
                    debug!("Sent {} to {}", method, notify.destination);
                }
            }
            debug!("Notify queue drained");
        });

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a request for sending. Never blocks.
    pub fn enqueue(&self, destination: SipEndPoint, request: Request) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(NotifierError::Shutdown)?;
        tx.send(OutboundNotify { destination, request })
            .map_err(|_| NotifierError::Shutdown)
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Close intake and wait for already queued requests to go out
    pub async fn stop(&self) -> Result<()> {
        // Dropping the sender lets the worker finish the backlog and exit
        self.tx.lock().take();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            match tokio::time::timeout(DRAIN_TIMEOUT, worker).await {
                Ok(Ok(())) => info!("Notify queue stopped"),
                Ok(Err(e)) => {
                    return Err(NotifierError::transport(format!("Notify queue worker failed: {}", e)));
                }
                Err(_) => warn!("Notify queue did not drain within {:?}", DRAIN_TIMEOUT),
            }
        }
        Ok(())
    }
}
